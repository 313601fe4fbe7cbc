use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use futures::channel::{mpsc::Sender, oneshot};
use tracing::trace;

use crate::host::{Callback, Host, TimerId, report_uncaught};
use crate::{Error, Result, TurnPin};

type CancelSender = oneshot::Sender<()>;

/// Host whose turns run on tokio through an [`Executor`](crate::Executor).
///
/// Every dispatch and every armed timer becomes one boxed future on a bounded queue. A
/// timer future races its sleep against a one-shot cancel channel held by the host.
pub struct TokioHost {
    turn_sender: RefCell<Sender<TurnPin>>,
    timers: Rc<RefCell<HashMap<TimerId, CancelSender>>>,
    next_timer: Cell<u64>,
}

impl TokioHost {
    pub(crate) fn new(turn_sender: Sender<TurnPin>) -> Self {
        Self {
            turn_sender: RefCell::new(turn_sender),
            timers: Rc::new(RefCell::new(HashMap::new())),
            next_timer: Cell::new(0),
        }
    }

    pub fn armed_timers(&self) -> usize {
        self.timers.borrow().len()
    }

    fn enqueue(&self, turn: TurnPin) -> Result<()> {
        self.turn_sender.borrow_mut().try_send(turn).map_err(|e| {
            if e.is_full() {
                Error::FullTaskQueue
            } else {
                Error::HostClosed
            }
        })
    }
}

impl Host for TokioHost {
    fn dispatch(&self, callback: Callback) -> Result<()> {
        let turn = async move {
            if let Err(error) = callback() {
                report_uncaught(&error);
            }
        };
        self.enqueue(Box::pin(turn))
    }

    fn set_timer(&self, callback: Callback, duration: Duration) -> Result<TimerId> {
        let id = TimerId(self.next_timer.get());
        self.next_timer.set(id.0 + 1);
        let (cancel_sender, cancel_receiver) = oneshot::channel();
        let timers = Rc::clone(&self.timers);

        let turn = async move {
            tokio::select! {
                // A dropped sender counts as a clear as well.
                _ = cancel_receiver => {
                    trace!(timer = id.0, "timer cleared");
                }
                () = tokio::time::sleep(duration) => {
                    timers.borrow_mut().remove(&id);
                    trace!(timer = id.0, "timer fired");
                    if let Err(error) = callback() {
                        report_uncaught(&error);
                    }
                }
            }
        };

        self.timers.borrow_mut().insert(id, cancel_sender);
        if let Err(error) = self.enqueue(Box::pin(turn)) {
            self.timers.borrow_mut().remove(&id);
            return Err(error);
        }
        trace!(timer = id.0, ?duration, "timer armed");
        Ok(id)
    }

    fn clear_timer(&self, timer: TimerId) {
        let cancel_sender = self.timers.borrow_mut().remove(&timer);
        if let Some(cancel_sender) = cancel_sender {
            // Fails only once the timer future is gone, which means it was never going to fire.
            let _ = cancel_sender.send(());
        }
    }
}
