//! Long-running work divided into increments, one increment per host turn.
//!
//! A [`LongTask`] calls its [`Step`] once per turn and reschedules itself with a
//! zero-duration timer until the step reports [`Progress::Finished`], fails, is
//! cancelled, or exceeds the runaway limit. The caller is never blocked.
//!
//! Cancellation is cooperative: [`LongTask::cancel`] only raises a flag that the next
//! turn checks after running its increment, so one more increment may run after a
//! cancel request.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::action::Finisher;
use crate::host::HostRef;
use crate::{Error, Result};

/// Runaway protection is off unless a limit is given.
pub const DEFAULT_RUNAWAY_LIMIT: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Finished,
}

/// How a long task ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeed,
    Cancelled,
    Failed(Error),
}

/// One increment of a long task.
///
/// A step keeps its own progress in fields; a turn boundary is nothing more than
/// returning [`Progress::Pending`].
pub trait Step {
    fn step(&mut self) -> anyhow::Result<Progress>;

    /// Notice that no further increments will be requested.
    fn cancel(&mut self) {}
}

pub struct FnStep<F>(F);

impl<F> Step for FnStep<F>
where
    F: FnMut() -> anyhow::Result<Progress>,
{
    fn step(&mut self) -> anyhow::Result<Progress> {
        (self.0)()
    }
}

pub fn step_fn<F>(f: F) -> FnStep<F>
where
    F: FnMut() -> anyhow::Result<Progress>,
{
    FnStep(f)
}

type CompletionNotifier = Box<dyn FnOnce(&Outcome)>;
type ProgressNotifier = Box<dyn FnMut(u64)>;

pub struct LongTaskBuilder {
    host: HostRef,
    step: Box<dyn Step>,
    runaway_limit: u64,
    on_complete: Option<CompletionNotifier>,
    on_progress: Option<ProgressNotifier>,
}

impl LongTaskBuilder {
    /// Ceiling on the number of turns; tripping it fails the task with
    /// [`Error::Runaway`]. Zero disables the check.
    pub fn runaway_limit(mut self, limit: u64) -> Self {
        self.runaway_limit = limit;
        self
    }

    pub fn on_complete(mut self, notifier: impl FnOnce(&Outcome) + 'static) -> Self {
        self.on_complete = Some(Box::new(notifier));
        self
    }

    /// Called after every turn that did not end the task, with the turn count so far.
    pub fn on_progress(mut self, notifier: impl FnMut(u64) + 'static) -> Self {
        self.on_progress = Some(Box::new(notifier));
        self
    }

    pub fn build(self) -> Rc<LongTask> {
        Rc::new_cyclic(|me| LongTask {
            me: me.clone(),
            host: self.host,
            step: RefCell::new(self.step),
            cancelled: Cell::new(false),
            runnable: Cell::new(true),
            started: Cell::new(false),
            runaway_limit: self.runaway_limit,
            count: Cell::new(0),
            on_complete: RefCell::new(self.on_complete),
            on_progress: RefCell::new(self.on_progress),
        })
    }
}

pub struct LongTask {
    me: Weak<LongTask>,
    host: HostRef,
    step: RefCell<Box<dyn Step>>,
    cancelled: Cell<bool>,
    runnable: Cell<bool>,
    started: Cell<bool>,
    runaway_limit: u64,
    count: Cell<u64>,
    on_complete: RefCell<Option<CompletionNotifier>>,
    on_progress: RefCell<Option<ProgressNotifier>>,
}

impl LongTask {
    pub fn builder(host: HostRef, step: impl Step + 'static) -> LongTaskBuilder {
        LongTaskBuilder {
            host,
            step: Box::new(step),
            runaway_limit: DEFAULT_RUNAWAY_LIMIT,
            on_complete: None,
            on_progress: None,
        }
    }

    pub fn new(host: HostRef, step: impl Step + 'static) -> Rc<Self> {
        Self::builder(host, step).build()
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.get()
    }

    pub fn runnable(&self) -> bool {
        self.runnable.get()
    }

    /// Turns run so far.
    pub fn count(&self) -> u64 {
        self.count.get()
    }

    pub fn runaway_limit(&self) -> u64 {
        self.runaway_limit
    }

    /// Schedules the first turn and returns immediately. If the host refuses the turn
    /// the task ends as failed with that error, which is also returned.
    pub fn run(&self) -> Result<()> {
        if !self.runnable.get() {
            return Err(Error::NotRunnable);
        }
        if self.started.replace(true) {
            return Err(Error::AlreadyRunning);
        }
        debug!(runaway_limit = self.runaway_limit, "long task started");
        self.schedule().inspect_err(|error| self.finish(Outcome::Failed(error.clone())))
    }

    /// Requests cancellation. Takes effect at the end of the next turn.
    pub fn cancel(&self) {
        trace!("long task cancel requested");
        self.cancelled.set(true);
    }

    fn schedule(&self) -> Result<()> {
        let me = self.me.upgrade().ok_or(Error::Released)?;
        self.host
            .set_timer(Box::new(move || me.turn()), Duration::ZERO)
            .map(drop)
    }

    fn turn(&self) -> Result<()> {
        if !self.runnable.get() {
            return Ok(());
        }
        let count = self.count.get() + 1;
        self.count.set(count);
        trace!(turn = count, "long task turn");

        let progress = self.step.borrow_mut().step();
        match progress {
            Err(error) => {
                debug!(turn = count, error = %error, "long task step failed");
                self.finish(Outcome::Failed(Error::from_anyhow(error)));
                return Ok(());
            }
            Ok(Progress::Finished) => {
                self.finish(Outcome::Succeed);
                return Ok(());
            }
            Ok(Progress::Pending) => {}
        }

        let runaway = self.runaway_limit > 0 && count >= self.runaway_limit;
        if runaway {
            warn!(limit = self.runaway_limit, "long task hit its runaway limit");
            self.cancelled.set(true);
        }
        if self.cancelled.get() {
            self.step.borrow_mut().cancel();
            self.finish(if runaway {
                Outcome::Failed(Error::Runaway(self.runaway_limit))
            } else {
                Outcome::Cancelled
            });
            return Ok(());
        }

        let notifier = self.on_progress.borrow_mut().take();
        if let Some(mut notifier) = notifier {
            notifier(count);
            *self.on_progress.borrow_mut() = Some(notifier);
        }

        if let Err(error) = self.schedule() {
            self.finish(Outcome::Failed(error));
        }
        Ok(())
    }

    fn finish(&self, outcome: Outcome) {
        self.runnable.set(false);
        debug!(turns = self.count.get(), ?outcome, "long task ended");
        let notifier = self.on_complete.borrow_mut().take();
        if let Some(notifier) = notifier {
            notifier(&outcome);
        }
    }
}

/// Pause/resume flag shared between a step and the nested actions it waits on.
///
/// The step pauses before starting a nested action, hands the action a
/// [`Handshake::resumer`] as its finisher, and reports [`Progress::Pending`] while the
/// flag is set. The next turn after the action completes picks up where it left off.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    paused: Rc<Cell<bool>>,
}

impl Handshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.set(true);
    }

    pub fn resume(&self) {
        self.paused.set(false);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.get()
    }

    pub fn resumer(&self) -> Option<Finisher> {
        let handshake = self.clone();
        crate::action::finisher(move || {
            handshake.resume();
            Ok(())
        })
    }
}
