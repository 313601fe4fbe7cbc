use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::{trace, warn};

use crate::{Error, Result};

/// Lifecycle of an action.
///
/// ```text
/// Init ──► Ready ──► Running ──┬──► Done
///                              └──► Exception
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    /// Constructed but still waiting for [`ActionCore::initialize`].
    Init,
    Ready,
    /// Entered synchronously by [`Action::go`], before the start routine runs.
    Running,
    Done,
    Exception,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Exception)
    }
}

/// Runs exactly once when an action completes, well or badly.
pub type Finisher = Box<dyn FnOnce() -> anyhow::Result<()>>;

/// Runs exactly once when an action completes badly, before the finisher.
pub type Catcher = Box<dyn FnOnce(&Error) -> anyhow::Result<()>>;

pub fn finisher(f: impl FnOnce() -> anyhow::Result<()> + 'static) -> Option<Finisher> {
    Some(Box::new(f))
}

pub fn catcher(f: impl FnOnce(&Error) -> anyhow::Result<()> + 'static) -> Option<Catcher> {
    Some(Box::new(f))
}

/// Identifies one side of a watch relation: the watched action hands out its slot index,
/// the watcher picks its own id for the notices it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct WatchId(pub usize);

/// Receiver of completion notices.
///
/// Errors returned from either notice are logged and dropped by the notifying action, so
/// a failing watcher never affects the other watchers or the action itself.
pub trait Watcher {
    fn notice_good(&self, their_id: WatchId) -> anyhow::Result<()>;

    fn notice_bad(&self, their_id: WatchId, error: &Error) -> anyhow::Result<()>;
}

struct Registration {
    watcher: Rc<dyn Watcher>,
    their_id: WatchId,
}

/// State shared by every kind of action: the state machine, the completion callbacks
/// and the watcher slots.
///
/// Fields are only ever borrowed for the duration of a single read or write, never
/// across a call into consumer code, so callbacks may freely call back into the action.
pub struct ActionCore {
    state: Cell<State>,
    exception: RefCell<Option<Error>>,
    finisher: RefCell<Option<Finisher>>,
    catcher: RefCell<Option<Catcher>>,
    // None once the watchers have been notified.
    watchers: RefCell<Option<Vec<Option<Registration>>>>,
}

impl ActionCore {
    pub fn new() -> Self {
        Self::in_state(State::Ready)
    }

    /// A core that needs [`ActionCore::initialize`] before it can be started.
    pub fn uninitialized() -> Self {
        Self::in_state(State::Init)
    }

    fn in_state(state: State) -> Self {
        Self {
            state: Cell::new(state),
            exception: RefCell::new(None),
            finisher: RefCell::new(None),
            catcher: RefCell::new(None),
            watchers: RefCell::new(Some(Vec::new())),
        }
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    pub fn initialize(&self) -> Result<()> {
        match self.state.get() {
            State::Init => {
                self.state.set(State::Ready);
                Ok(())
            }
            other => Err(Error::InvalidState(other)),
        }
    }

    /// Ready → Running, recording the completion callbacks. Fails without side effects
    /// in any other state.
    pub(crate) fn begin(&self, finisher: Option<Finisher>, catcher: Option<Catcher>) -> Result<()> {
        let state = self.state.get();
        if state != State::Ready {
            return Err(Error::InvalidState(state));
        }
        *self.finisher.borrow_mut() = finisher;
        *self.catcher.borrow_mut() = catcher;
        self.state.set(State::Running);
        trace!("action running");
        Ok(())
    }

    /// Running → Done or Exception. Returns false, changing nothing, unless the action
    /// is running.
    fn settle(&self, state: State, exception: Option<Error>) -> bool {
        let current = self.state.get();
        if current != State::Running {
            trace!(?current, "ignoring completion of an action that is not running");
            return false;
        }
        self.state.set(state);
        *self.exception.borrow_mut() = exception;
        trace!(?state, "action completed");
        true
    }

    pub fn exception(&self) -> Result<Error> {
        match (self.state.get(), self.exception.borrow().as_ref()) {
            (State::Exception, Some(e)) => Ok(e.clone()),
            _ => Err(Error::NoException),
        }
    }

    pub fn watch(&self, watcher: Rc<dyn Watcher>, their_id: WatchId) -> Result<WatchId> {
        if self.state.get().is_terminal() {
            return Err(Error::AlreadyCompleted);
        }
        let mut watchers = self.watchers.borrow_mut();
        let slots = watchers.as_mut().ok_or(Error::AlreadyCompleted)?;
        slots.push(Some(Registration { watcher, their_id }));
        Ok(WatchId(slots.len() - 1))
    }

    pub fn withdraw(&self, our_id: WatchId) {
        if let Some(slot) = self
            .watchers
            .borrow_mut()
            .as_mut()
            .and_then(|slots| slots.get_mut(our_id.0))
        {
            *slot = None;
        }
    }

    /// Notifies live watchers in registration order, then drops the whole list.
    ///
    /// Each slot is emptied just before its watcher is called, so a watcher withdrawn by
    /// an earlier watcher's notice is skipped.
    fn notify(&self, mut signal: impl FnMut(&dyn Watcher, WatchId) -> anyhow::Result<()>) {
        let len = self.watchers.borrow().as_ref().map_or(0, Vec::len);
        for index in 0..len {
            let registration = self
                .watchers
                .borrow_mut()
                .as_mut()
                .and_then(|slots| slots.get_mut(index))
                .and_then(Option::take);
            let Some(registration) = registration else {
                continue;
            };
            if let Err(error) = signal(registration.watcher.as_ref(), registration.their_id) {
                warn!(watcher = index, error = %error, "ignoring failed watcher notice");
            }
        }
        self.watchers.borrow_mut().take();
    }

    fn run_catcher(&self, error: &Error) -> Result<()> {
        let catcher = self.catcher.borrow_mut().take();
        match catcher {
            Some(catcher) => catcher(error).map_err(Error::from_anyhow),
            None => Ok(()),
        }
    }

    fn run_finisher(&self) -> Result<()> {
        let finisher = self.finisher.borrow_mut().take();
        match finisher {
            Some(finisher) => finisher().map_err(Error::from_anyhow),
            None => Ok(()),
        }
    }
}

impl Default for ActionCore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ActionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionCore")
            .field("state", &self.state.get())
            .field("exception", &self.exception.borrow())
            .finish_non_exhaustive()
    }
}

/// A unit of asynchronous work with a one-shot completion.
///
/// Implementors provide the shared [`ActionCore`], their reliability and the start
/// routine; everything else is provided. Actions are handled as `Rc<Self>` or
/// `Rc<dyn Action>` and are never reused after completion.
pub trait Action {
    fn core(&self) -> &ActionCore;

    /// Whether the action is guaranteed to eventually complete and report it. Fixed per
    /// action kind; composites derive it from their members.
    fn reliable(&self) -> bool;

    /// Begins the underlying work. Called by [`Action::go`] once the state is `Running`.
    fn start(&self) -> Result<()>;

    /// Releases resources held for the work. Called once, on completion, before any
    /// watcher is notified.
    fn terminate(&self) {}

    fn state(&self) -> State {
        self.core().state()
    }

    fn completed(&self) -> bool {
        self.state().is_terminal()
    }

    fn completed_well(&self) -> bool {
        self.state() == State::Done
    }

    fn exception(&self) -> Result<Error> {
        self.core().exception()
    }

    /// Starts the action. The state is `Running` when this returns, unless the work
    /// already completed synchronously. Errors from a synchronous completion's finisher
    /// or catcher propagate from here.
    fn go(&self, finisher: Option<Finisher>, catcher: Option<Catcher>) -> Result<()> {
        self.core().begin(finisher, catcher)?;
        match self.start() {
            Ok(()) => Ok(()),
            Err(error) => self.end_badly(error),
        }
    }

    fn run(&self) -> Result<()> {
        self.go(None, None)
    }

    /// Completes well: watchers get a good notice, then the finisher runs. A finisher
    /// error propagates but the action stays `Done`. No-op unless the action is running.
    fn end_well(&self) -> Result<()> {
        if !self.core().settle(State::Done, None) {
            return Ok(());
        }
        self.terminate();
        self.core().notify(|watcher, id| watcher.notice_good(id));
        self.core().run_finisher()
    }

    /// Completes badly: watchers get a bad notice, then the catcher runs, then the
    /// finisher runs whether or not the catcher failed. No-op unless the action is running.
    fn end_badly(&self, error: Error) -> Result<()> {
        if !self.core().settle(State::Exception, Some(error.clone())) {
            return Ok(());
        }
        self.terminate();
        self.core().notify(|watcher, id| watcher.notice_bad(id, &error));
        let caught = self.core().run_catcher(&error);
        let finished = self.core().run_finisher();
        match (caught, finished) {
            (Err(catcher_error), Err(finisher_error)) => {
                warn!(error = %catcher_error, "catcher error superseded by finisher error");
                Err(finisher_error)
            }
            (Err(error), Ok(())) | (Ok(()), Err(error)) => Err(error),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    fn watch(&self, watcher: Rc<dyn Watcher>, their_id: WatchId) -> Result<WatchId> {
        self.core().watch(watcher, their_id)
    }

    fn withdraw(&self, our_id: WatchId) {
        self.core().withdraw(our_id);
    }
}
