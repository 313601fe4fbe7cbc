#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use coact::{Catcher, Executor, Finisher, Progress, Step, catcher, finisher};

pub const STANDARD_TURN_QUEUE_SIZE: usize = 16;
pub const STRESS_TEST_FAN_OUT: usize = 10_000;

pub type Log = Rc<RefCell<Vec<String>>>;

pub fn log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

pub fn logging_finisher(log: &Log, entry: &str) -> Option<Finisher> {
    let log = Rc::clone(log);
    let entry = entry.to_string();
    finisher(move || {
        log.borrow_mut().push(entry);
        Ok(())
    })
}

pub fn logging_catcher(log: &Log) -> Option<Catcher> {
    let log = Rc::clone(log);
    catcher(move |e| {
        log.borrow_mut().push(format!("caught {e}"));
        Ok(())
    })
}

pub async fn await_signal<T>(
    recv: futures::channel::oneshot::Receiver<T>,
    executor: &mut Executor,
) -> T {
    tokio::select! {
        () = executor.execute() => {
            panic!("executor should never finish before the signal")
        },
        value = recv => {
            value.unwrap()
        }
    }
}

pub async fn poll_executor_for(duration: tokio::time::Duration, executor: &mut Executor) {
    let _ = tokio::time::timeout(duration, executor.execute()).await;
}

/// Finishes after `total` increments, counting them in `done`.
pub struct CountingStep {
    pub total: u64,
    pub done: Rc<Cell<u64>>,
    pub cancelled: Rc<Cell<bool>>,
}

impl CountingStep {
    pub fn new(total: u64) -> (Self, Rc<Cell<u64>>, Rc<Cell<bool>>) {
        let done = Rc::new(Cell::new(0));
        let cancelled = Rc::new(Cell::new(false));
        (
            Self {
                total,
                done: Rc::clone(&done),
                cancelled: Rc::clone(&cancelled),
            },
            done,
            cancelled,
        )
    }
}

impl Step for CountingStep {
    fn step(&mut self) -> anyhow::Result<Progress> {
        self.done.set(self.done.get() + 1);
        if self.done.get() >= self.total {
            Ok(Progress::Finished)
        } else {
            Ok(Progress::Pending)
        }
    }

    fn cancel(&mut self) {
        self.cancelled.set(true);
    }
}
