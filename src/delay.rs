use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::trace;

use crate::action::{Action, ActionCore, State};
use crate::defer::{Trial, settle_trial};
use crate::host::{HostRef, TimerId};
use crate::{Error, Result};

/// Runs a trial once a duration has elapsed, unless cancelled or aborted first.
///
/// Reliable even when ended early: both [`Delay::cancel`] and [`Delay::abort`] complete
/// the action, so its finisher and watchers always hear about it.
pub struct Delay {
    me: Weak<Delay>,
    core: ActionCore,
    host: HostRef,
    trial: RefCell<Option<Trial>>,
    duration: Cell<Duration>,
    timer: Cell<Option<TimerId>>,
}

impl Delay {
    pub fn new(
        host: HostRef,
        trial: impl FnOnce() -> anyhow::Result<()> + 'static,
        duration: Duration,
    ) -> Rc<Self> {
        let delay = Self::build(host, ActionCore::new());
        *delay.trial.borrow_mut() = Some(Box::new(trial));
        delay.duration.set(duration);
        delay
    }

    /// A delay in the `Init` state, made ready by [`Delay::initialize`].
    pub fn uninit(host: HostRef) -> Rc<Self> {
        Self::build(host, ActionCore::uninitialized())
    }

    fn build(host: HostRef, core: ActionCore) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            me: me.clone(),
            core,
            host,
            trial: RefCell::new(None),
            duration: Cell::new(Duration::ZERO),
            timer: Cell::new(None),
        })
    }

    pub fn initialize(
        &self,
        trial: impl FnOnce() -> anyhow::Result<()> + 'static,
        duration: Duration,
    ) -> Result<()> {
        self.core.initialize()?;
        *self.trial.borrow_mut() = Some(Box::new(trial));
        self.duration.set(duration);
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        self.duration.get()
    }

    /// Ends a running delay well without running its trial. No-op once completed.
    pub fn cancel(&self) -> Result<()> {
        self.ensure_started()?;
        self.disarm();
        self.end_well()
    }

    /// Ends a running delay badly without running its trial, with [`Error::Aborted`]
    /// unless another error is given. No-op once completed.
    pub fn abort(&self, error: Option<Error>) -> Result<()> {
        self.ensure_started()?;
        self.disarm();
        self.end_badly(error.unwrap_or(Error::Aborted))
    }

    fn ensure_started(&self) -> Result<()> {
        match self.state() {
            State::Init | State::Ready => Err(Error::InvalidState(self.state())),
            State::Running | State::Done | State::Exception => Ok(()),
        }
    }

    fn disarm(&self) {
        if let Some(timer) = self.timer.take() {
            trace!(timer = timer.0, "disarming delay");
            self.host.clear_timer(timer);
        }
    }

    fn body(&self) -> Result<()> {
        self.timer.set(None);
        if self.completed() {
            return Ok(());
        }
        let trial = self.trial.borrow_mut().take();
        settle_trial(self, trial)
    }
}

impl Action for Delay {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn reliable(&self) -> bool {
        true
    }

    fn start(&self) -> Result<()> {
        let me = self.me.upgrade().ok_or(Error::Released)?;
        let timer = self
            .host
            .set_timer(Box::new(move || me.body()), self.duration.get())?;
        self.timer.set(Some(timer));
        Ok(())
    }

    fn terminate(&self) {
        self.disarm();
        let trial = self.trial.borrow_mut().take();
        drop(trial);
    }
}
