//! Deterministic single-threaded host with a virtual clock.
//!
//! Dispatched callbacks run first-in first-out. Timers run once the dispatch queue is
//! empty and the virtual clock has reached their deadline, ordered by deadline and then by
//! arming order. The clock only moves when [`LocalHost::advance`] or
//! [`LocalHost::run_until_idle`] moves it.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use tracing::trace;

use crate::host::{Callback, Host, TimerId, report_uncaught};
use crate::{Error, Result};

#[derive(Default)]
pub struct LocalHost {
    queue: RefCell<VecDeque<Callback>>,
    timers: RefCell<BTreeMap<(Duration, u64), Callback>>,
    deadlines: RefCell<HashMap<TimerId, Duration>>,
    now: Cell<Duration>,
    next_timer: Cell<u64>,
    errors: RefCell<Vec<Error>>,
}

impl LocalHost {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Virtual time elapsed since the host was created.
    pub fn now(&self) -> Duration {
        self.now.get()
    }

    pub fn pending_dispatches(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn armed_timers(&self) -> usize {
        self.timers.borrow().len()
    }

    /// Errors reported by callbacks since the last call.
    pub fn take_errors(&self) -> Vec<Error> {
        std::mem::take(&mut *self.errors.borrow_mut())
    }

    /// Runs one unit of work that is due at the current virtual time. Returns false if
    /// there was none.
    pub fn turn(&self) -> bool {
        let next = self.queue.borrow_mut().pop_front();
        let callback = match next {
            Some(callback) => callback,
            None => match self.pop_due_timer() {
                Some(callback) => callback,
                None => return false,
            },
        };
        if let Err(error) = callback() {
            self.report_error(error);
        }
        true
    }

    /// Runs work until nothing is due at the current virtual time. Returns the number of
    /// turns taken.
    pub fn run_until_stalled(&self) -> usize {
        let mut turns = 0;
        while self.turn() {
            turns += 1;
        }
        turns
    }

    /// Moves the clock forward by `by`, running everything that falls due on the way.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.now.get().saturating_add(by);
        let mut turns = self.run_until_stalled();
        while let Some(deadline) = self.next_deadline().filter(|deadline| *deadline <= target) {
            self.now.set(deadline.max(self.now.get()));
            turns += self.run_until_stalled();
        }
        self.now.set(target);
        turns + self.run_until_stalled()
    }

    /// Runs until neither dispatched work nor timers remain, moving the clock as far as
    /// the last timer needs. Does not return while some task keeps rescheduling itself.
    pub fn run_until_idle(&self) -> usize {
        let mut turns = self.run_until_stalled();
        while let Some(deadline) = self.next_deadline() {
            self.now.set(deadline.max(self.now.get()));
            turns += self.run_until_stalled();
        }
        turns
    }

    fn next_deadline(&self) -> Option<Duration> {
        self.timers.borrow().keys().next().map(|(deadline, _)| *deadline)
    }

    fn pop_due_timer(&self) -> Option<Callback> {
        let mut timers = self.timers.borrow_mut();
        let key = *timers.keys().next().filter(|(deadline, _)| *deadline <= self.now.get())?;
        self.deadlines.borrow_mut().remove(&TimerId(key.1));
        trace!(timer = key.1, "timer fired");
        timers.remove(&key)
    }
}

impl Host for LocalHost {
    fn dispatch(&self, callback: Callback) -> Result<()> {
        self.queue.borrow_mut().push_back(callback);
        Ok(())
    }

    fn set_timer(&self, callback: Callback, duration: Duration) -> Result<TimerId> {
        let seq = self.next_timer.get();
        self.next_timer.set(seq + 1);
        // Far-off deadlines are capped rather than overflowing the clock.
        let deadline = self.now.get().saturating_add(duration);
        let id = TimerId(seq);
        self.timers.borrow_mut().insert((deadline, seq), callback);
        self.deadlines.borrow_mut().insert(id, deadline);
        trace!(timer = seq, ?deadline, "timer armed");
        Ok(id)
    }

    fn clear_timer(&self, timer: TimerId) {
        let deadline = self.deadlines.borrow_mut().remove(&timer);
        if let Some(deadline) = deadline {
            // Dropped outside the borrow: the callback may own actions that touch this host.
            let callback = self.timers.borrow_mut().remove(&(deadline, timer.0));
            trace!(timer = timer.0, "timer cleared");
            drop(callback);
        }
    }

    fn report_error(&self, error: Error) {
        report_uncaught(&error);
        self.errors.borrow_mut().push(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(log: &Rc<RefCell<Vec<&'static str>>>, entry: &'static str) -> Callback {
        let log = Rc::clone(log);
        Box::new(move || {
            log.borrow_mut().push(entry);
            Ok(())
        })
    }

    #[test]
    fn dispatch_before_due_timers() {
        let host = LocalHost::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        host.set_timer(push(&log, "timer"), Duration::ZERO).unwrap();
        host.dispatch(push(&log, "first")).unwrap();
        host.dispatch(push(&log, "second")).unwrap();

        assert_eq!(host.run_until_stalled(), 3);
        assert_eq!(*log.borrow(), ["first", "second", "timer"]);
    }

    #[test]
    fn timers_fire_by_deadline_then_arming_order() {
        let host = LocalHost::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        host.set_timer(push(&log, "late"), Duration::from_millis(20)).unwrap();
        host.set_timer(push(&log, "early-a"), Duration::from_millis(10)).unwrap();
        host.set_timer(push(&log, "early-b"), Duration::from_millis(10)).unwrap();

        host.advance(Duration::from_millis(15));
        assert_eq!(*log.borrow(), ["early-a", "early-b"]);
        assert_eq!(host.now(), Duration::from_millis(15));

        host.run_until_idle();
        assert_eq!(*log.borrow(), ["early-a", "early-b", "late"]);
        assert_eq!(host.now(), Duration::from_millis(20));
    }

    #[test]
    fn cleared_timer_never_fires() {
        let host = LocalHost::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let timer = host.set_timer(push(&log, "timer"), Duration::from_millis(5)).unwrap();
        host.clear_timer(timer);
        host.clear_timer(timer);

        host.run_until_idle();
        assert!(log.borrow().is_empty());
        assert_eq!(host.armed_timers(), 0);
    }

    #[test]
    fn far_deadlines_saturate_the_clock() {
        let host = LocalHost::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        host.advance(Duration::from_millis(1));
        host.set_timer(push(&log, "never"), Duration::MAX).unwrap();

        host.advance(Duration::from_secs(3600));
        assert!(log.borrow().is_empty());
        assert_eq!(host.armed_timers(), 1);

        host.advance(Duration::MAX);
        assert_eq!(host.now(), Duration::MAX);
        assert_eq!(*log.borrow(), ["never"]);
    }

    #[test]
    fn callback_errors_are_reported() {
        let host = LocalHost::new();
        host.dispatch(Box::new(|| -> Result<()> { Err(Error::Aborted) }))
            .unwrap();
        host.run_until_stalled();
        assert!(matches!(host.take_errors().as_slice(), [Error::Aborted]));
        assert!(host.take_errors().is_empty());
    }
}
