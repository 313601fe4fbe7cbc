//! Actions that complete when another action completes.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::trace;

use crate::action::{Action, ActionCore, State, WatchId, Watcher};
use crate::host::{HostRef, TimerId};
use crate::{Error, Result};

/// The tie between a join and the single action it waits on.
///
/// The target is held only until the join completes. A result reported while the join
/// is still `Ready` is kept back until the join is started.
struct JoinLink {
    target: RefCell<Option<Rc<dyn Action>>>,
    our_id: Cell<Option<WatchId>>,
    early: RefCell<Option<Result<()>>>,
    reliable: bool,
}

impl JoinLink {
    fn new(target: Option<Rc<dyn Action>>) -> Result<Self> {
        let target = target.ok_or(Error::MissingJoinTarget)?;
        Ok(Self {
            reliable: target.reliable(),
            target: RefCell::new(Some(target)),
            our_id: Cell::new(None),
            early: RefCell::new(None),
        })
    }

    fn attach(&self, watcher: Rc<dyn Watcher>) -> Result<()> {
        let target = self.target.borrow().clone();
        if let Some(target) = target.filter(|target| !target.completed()) {
            let id = target.watch(watcher, WatchId::default())?;
            self.our_id.set(Some(id));
        }
        Ok(())
    }

    /// The target's result, if it is already known.
    fn settled(&self) -> Option<Result<()>> {
        if let Some(early) = self.early.borrow_mut().take() {
            return Some(early);
        }
        let target = self.target.borrow().clone()?;
        if !target.completed() {
            return None;
        }
        Some(target.exception().map_or(Ok(()), Err))
    }

    fn notice(&self, join: &dyn Action, result: Result<()>) -> anyhow::Result<()> {
        self.our_id.set(None);
        match join.state() {
            State::Init | State::Ready => {
                *self.early.borrow_mut() = Some(result);
                Ok(())
            }
            State::Running => Ok(complete(join, result)?),
            State::Done | State::Exception => Ok(()),
        }
    }

    fn release(&self) {
        let target = self.target.borrow_mut().take();
        if let (Some(target), Some(id)) = (target, self.our_id.take()) {
            target.withdraw(id);
        }
    }
}

fn complete(action: &dyn Action, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => action.end_well(),
        Err(error) => action.end_badly(error),
    }
}

/// Completes as the joined action completes, with the same exception if it failed.
///
/// Never completes before [`Action::go`] is called on it, even when the joined action
/// has long finished.
///
/// While neither side has completed, the join and the joined action keep each other
/// alive: the join holds the target and the target's watcher slot holds the join. The
/// pair is freed once either completes, but a join that is never started on a target
/// that never completes leaks both.
pub struct Join {
    core: ActionCore,
    link: JoinLink,
}

impl Join {
    pub fn new(target: Option<Rc<dyn Action>>) -> Result<Rc<Self>> {
        let join = Rc::new(Self {
            core: ActionCore::new(),
            link: JoinLink::new(target)?,
        });
        join.link.attach(join.clone())?;
        Ok(join)
    }

    pub fn on(target: Rc<dyn Action>) -> Result<Rc<Self>> {
        Self::new(Some(target))
    }
}

impl Action for Join {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn reliable(&self) -> bool {
        self.link.reliable
    }

    fn start(&self) -> Result<()> {
        match self.link.settled() {
            Some(result) => complete(self, result),
            None => Ok(()),
        }
    }

    fn terminate(&self) {
        self.link.release();
    }
}

impl Watcher for Join {
    fn notice_good(&self, _: WatchId) -> anyhow::Result<()> {
        self.link.notice(self, Ok(()))
    }

    fn notice_bad(&self, _: WatchId, error: &Error) -> anyhow::Result<()> {
        self.link.notice(self, Err(error.clone()))
    }
}

/// A [`Join`] raced against a timer armed when the join is started.
///
/// If the timer wins, the join completes badly with [`Error::TimedOut`] and stops
/// watching; later completion of the joined action has no effect on it.
///
/// Shares the reference cycle of [`Join`] until either side completes.
pub struct JoinTimeout {
    me: Weak<JoinTimeout>,
    core: ActionCore,
    link: JoinLink,
    host: HostRef,
    duration: Duration,
    timer: Cell<Option<TimerId>>,
    timed_out: Cell<bool>,
}

impl JoinTimeout {
    pub fn new(
        host: HostRef,
        target: Option<Rc<dyn Action>>,
        duration: Duration,
    ) -> Result<Rc<Self>> {
        let link = JoinLink::new(target)?;
        let join = Rc::new_cyclic(|me| Self {
            me: me.clone(),
            core: ActionCore::new(),
            link,
            host,
            duration,
            timer: Cell::new(None),
            timed_out: Cell::new(false),
        });
        join.link.attach(join.clone())?;
        Ok(join)
    }

    pub fn on(host: HostRef, target: Rc<dyn Action>, duration: Duration) -> Result<Rc<Self>> {
        Self::new(host, Some(target), duration)
    }

    /// Whether the timer won the race. Only meaningful once completed.
    pub fn timed_out(&self) -> Result<bool> {
        if self.completed() {
            Ok(self.timed_out.get())
        } else {
            Err(Error::NotCompleted)
        }
    }

    fn ding(&self) -> Result<()> {
        self.timer.set(None);
        if self.completed() {
            return Ok(());
        }
        trace!(?self.duration, "join timed out");
        self.timed_out.set(true);
        self.end_badly(Error::TimedOut)
    }
}

impl Action for JoinTimeout {
    fn core(&self) -> &ActionCore {
        &self.core
    }

    fn reliable(&self) -> bool {
        // Derived from the joined action, like every composite.
        self.link.reliable
    }

    fn start(&self) -> Result<()> {
        if let Some(result) = self.link.settled() {
            return complete(self, result);
        }
        let me = self.me.upgrade().ok_or(Error::Released)?;
        let timer = self
            .host
            .set_timer(Box::new(move || me.ding()), self.duration)?;
        self.timer.set(Some(timer));
        Ok(())
    }

    fn terminate(&self) {
        if let Some(timer) = self.timer.take() {
            self.host.clear_timer(timer);
        }
        self.link.release();
    }
}

impl Watcher for JoinTimeout {
    fn notice_good(&self, _: WatchId) -> anyhow::Result<()> {
        self.link.notice(self, Ok(()))
    }

    fn notice_bad(&self, _: WatchId, error: &Error) -> anyhow::Result<()> {
        self.link.notice(self, Err(error.clone()))
    }
}
