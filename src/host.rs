use std::rc::Rc;
use std::time::Duration;

use tracing::error;

use crate::{Error, Result};

/// Work handed to a host. An `Err` is an uncaught error and goes to [`Host::report_error`].
pub type Callback = Box<dyn FnOnce() -> Result<()>>;

pub type HostRef = Rc<dyn Host>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u64);

/// The scheduling primitives of the hosting event loop.
///
/// Hosts run one callback at a time; nothing here is thread safe and nothing needs to be.
pub trait Host {
    /// Runs `callback` after the current turn has finished.
    fn dispatch(&self, callback: Callback) -> Result<()>;

    /// Arms a one-shot timer that runs `callback` once `duration` has elapsed.
    fn set_timer(&self, callback: Callback, duration: Duration) -> Result<TimerId>;

    /// Disarms a timer. Clearing a timer that already fired or was cleared is a no-op.
    fn clear_timer(&self, timer: TimerId);

    fn report_error(&self, error: Error) {
        report_uncaught(&error);
    }
}

pub(crate) fn report_uncaught(error: &Error) {
    error!(%error, "uncaught error in host callback");
}
