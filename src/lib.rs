//! Cooperative actions for a single-threaded event loop.
//!
//! An [`Action`] is a piece of work that completes now or later, well or badly, and that
//! other work may wait on through the [`Watcher`] protocol. Primitive actions ([`Defer`],
//! [`Delay`]) run a trial on a later turn of the host; joins ([`Join`], [`JoinTimeout`],
//! [`JoinConjunction`]) complete when the actions they watch complete. A [`LongTask`]
//! drives a step function one increment per turn until it finishes, is cancelled, or
//! trips its runaway limit.
//!
//! The event loop itself is injected as a [`Host`]: [`LocalHost`] is deterministic with a
//! virtual clock, [`TokioHost`] feeds an [`Executor`] running on tokio.

use std::pin::Pin;
use std::sync::Arc;

pub mod action;
pub mod conjunction;
pub mod defer;
pub mod delay;
pub mod dispatching;
pub mod execution;
pub mod factory;
pub mod host;
pub mod join;
pub mod local;
pub mod long_task;

pub use action::{Action, ActionCore, Catcher, Finisher, State, WatchId, Watcher, catcher, finisher};
pub use conjunction::JoinConjunction;
pub use defer::{Defer, Trial};
pub use delay::Delay;
pub use dispatching::TokioHost;
pub use execution::Executor;
pub use factory::Factory;
pub use host::{Callback, Host, HostRef, TimerId};
pub use join::{Join, JoinTimeout};
pub use local::LocalHost;
pub use long_task::{
    DEFAULT_RUNAWAY_LIMIT, Handshake, LongTask, LongTaskBuilder, Outcome, Progress, Step, step_fn,
};

type TurnBox = Box<dyn Future<Output = ()> + 'static>;
pub(crate) type TurnPin = Pin<TurnBox>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("call is invalid because the action is in state {0:?}")]
    InvalidState(State),
    #[error("action to be joined may not be absent")]
    MissingJoinTarget,
    #[error("action has already completed and accepts no watchers")]
    AlreadyCompleted,
    #[error("action is not in an exception state")]
    NoException,
    #[error("action is not yet completed")]
    NotCompleted,
    #[error("action was released before its work could be scheduled")]
    Released,
    #[error("action aborted by external command")]
    Aborted,
    #[error("action timed out")]
    TimedOut,
    #[error("long task no longer runnable")]
    NotRunnable,
    #[error("long task is already running")]
    AlreadyRunning,
    #[error("long task exceeded its runaway limit of {0} turns")]
    Runaway(u64),
    #[error("turn queue is full")]
    FullTaskQueue,
    #[error("host executor is gone")]
    HostClosed,
    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),
}

impl Error {
    /// Errors raised by consumer code keep their identity when they are ours.
    pub fn from_anyhow(error: anyhow::Error) -> Self {
        match error.downcast::<Error>() {
            Ok(ours) => ours,
            Err(other) => Error::Failed(Arc::new(other)),
        }
    }
}
