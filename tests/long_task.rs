mod utils;

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use coact::{
        Action, Defer, Error, Factory, Handshake, HostRef, LongTask, Outcome, Progress, Step,
    };

    use crate::utils::CountingStep;

    fn outcome_slot() -> (Rc<RefCell<Option<Outcome>>>, impl FnOnce(&Outcome) + 'static) {
        let slot = Rc::new(RefCell::new(None));
        let writer = Rc::clone(&slot);
        (slot, move |outcome: &Outcome| {
            *writer.borrow_mut() = Some(outcome.clone());
        })
    }

    #[test]
    fn finishes_within_runaway_limit() {
        let host = Factory::local();
        let (step, done, cancelled) = CountingStep::new(5);
        let (outcome, on_complete) = outcome_slot();
        let task = LongTask::builder(host.clone(), step)
            .runaway_limit(5)
            .on_complete(on_complete)
            .build();

        task.run().unwrap();
        host.run_until_idle();

        assert_eq!(done.get(), 5);
        assert_eq!(task.count(), 5);
        assert!(!cancelled.get());
        assert!(!task.runnable());
        assert!(matches!(*outcome.borrow(), Some(Outcome::Succeed)));
    }

    #[test]
    fn runaway_limit_stops_task_early() {
        let host = Factory::local();
        let (step, done, cancelled) = CountingStep::new(10);
        let (outcome, on_complete) = outcome_slot();
        let task = LongTask::builder(host.clone(), step)
            .runaway_limit(4)
            .on_complete(on_complete)
            .build();

        task.run().unwrap();
        host.run_until_idle();

        assert_eq!(done.get(), 4);
        assert!(cancelled.get());
        assert!(task.cancelled());
        assert!(!task.runnable());
        assert!(matches!(
            *outcome.borrow(),
            Some(Outcome::Failed(Error::Runaway(4)))
        ));
    }

    #[test]
    fn one_turn_per_host_turn() {
        let host = Factory::local();
        let (step, done, _) = CountingStep::new(3);
        let task = LongTask::new(host.clone(), step);
        task.run().unwrap();

        for expected in 1..=3 {
            assert!(host.turn());
            assert_eq!(done.get(), expected);
        }
        assert!(!host.turn());
        assert!(!task.runnable());
    }

    #[test]
    fn cancel_between_turns_allows_one_more_increment() {
        let host = Factory::local();
        let (step, done, cancelled) = CountingStep::new(100);
        let (outcome, on_complete) = outcome_slot();
        let task = LongTask::builder(host.clone(), step)
            .on_complete(on_complete)
            .build();
        task.run().unwrap();

        host.turn();
        host.turn();
        assert_eq!(done.get(), 2);

        task.cancel();
        assert!(task.runnable());
        host.run_until_idle();

        assert_eq!(done.get(), 3);
        assert!(cancelled.get());
        assert!(!task.runnable());
        assert!(matches!(*outcome.borrow(), Some(Outcome::Cancelled)));
        assert!(matches!(task.run(), Err(Error::NotRunnable)));
    }

    #[test]
    fn progress_is_reported_for_unfinished_turns() {
        let host = Factory::local();
        let (step, _, _) = CountingStep::new(3);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let task = LongTask::builder(host.clone(), step)
            .on_progress(move |turns| sink.borrow_mut().push(turns))
            .build();

        task.run().unwrap();
        host.run_until_idle();
        assert_eq!(*seen.borrow(), [1, 2]);
    }

    /// Walks a list of items, waiting on one deferred action per item.
    struct NestedStep {
        host: HostRef,
        handshake: Handshake,
        next: usize,
        items: usize,
        processed: Rc<RefCell<Vec<usize>>>,
        waiting_turns: Rc<Cell<u32>>,
    }

    impl Step for NestedStep {
        fn step(&mut self) -> anyhow::Result<Progress> {
            if self.handshake.is_paused() {
                self.waiting_turns.set(self.waiting_turns.get() + 1);
                return Ok(Progress::Pending);
            }
            if self.next == self.items {
                return Ok(Progress::Finished);
            }
            let item = self.next;
            self.next += 1;
            let processed = Rc::clone(&self.processed);
            let action = Defer::new(self.host.clone(), move || {
                processed.borrow_mut().push(item);
                Ok(())
            });
            self.handshake.pause();
            action.go(self.handshake.resumer(), None)?;
            Ok(Progress::Pending)
        }
    }

    #[test]
    fn step_pauses_for_nested_action() {
        let host = Factory::local();
        let processed = Rc::new(RefCell::new(Vec::new()));
        let waiting_turns = Rc::new(Cell::new(0));
        let step = NestedStep {
            host: host.clone(),
            handshake: Handshake::new(),
            next: 0,
            items: 3,
            processed: Rc::clone(&processed),
            waiting_turns: Rc::clone(&waiting_turns),
        };
        let (outcome, on_complete) = outcome_slot();
        let task = LongTask::builder(host.clone(), step)
            .on_complete(on_complete)
            .build();

        task.run().unwrap();
        host.run_until_idle();

        assert_eq!(*processed.borrow(), [0, 1, 2]);
        assert_eq!(waiting_turns.get(), 0);
        assert!(matches!(*outcome.borrow(), Some(Outcome::Succeed)));
        // One turn per item to start it, one to see the end of the list.
        assert_eq!(task.count(), 4);
    }

    #[test]
    fn handshake_resumer_clears_pause() {
        let handshake = Handshake::new();
        handshake.pause();
        let resumer = handshake.resumer().unwrap();
        assert!(handshake.is_paused());
        resumer().unwrap();
        assert!(!handshake.is_paused());
    }
}
