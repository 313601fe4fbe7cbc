use futures::{StreamExt, channel::mpsc::Receiver, stream::FuturesUnordered};
use std::future::poll_fn;
use std::task::Poll;
use tokio::select;
use tracing::{trace, warn};

use crate::TurnPin;

/// Drives the turns of a [`TokioHost`](crate::TokioHost) on the current tokio thread.
///
/// Turns are not `Send`, so the executor must be awaited on the thread that owns the
/// host, e.g. from a current-thread runtime or a `LocalSet`.
pub struct Executor {
    turns: FuturesUnordered<TurnPin>,
    turn_receiver: Receiver<TurnPin>,
    completed: u64,
}

impl Executor {
    pub(crate) fn new(turn_receiver: Receiver<TurnPin>) -> Self {
        Self {
            turn_receiver,
            turns: FuturesUnordered::new(),
            completed: 0,
        }
    }

    /// Number of turns (dispatches and fired or cleared timers) run to the end so far.
    pub fn completed_turns(&self) -> u64 {
        self.completed
    }

    /// Runs turns until the host is dropped and every queued turn has finished.
    pub async fn execute(&mut self) {
        let mut open = true;
        while open || !self.turns.is_empty() {
            let next_turn = poll_fn(|cx| {
                if self.turns.is_empty() {
                    Poll::Pending
                } else {
                    self.turns.poll_next_unpin(cx)
                }
            });

            select! {
                turn = self.turn_receiver.next(), if open => {
                    if let Some(turn) = turn {
                        trace!("queueing turn");
                        self.turns.push(turn);
                    } else {
                        warn!("host dropped, no new turns can be queued");
                        open = false;
                    }
                },
                Some(()) = next_turn => {
                    self.completed += 1;
                    trace!(completed = self.completed, "turn finished");
                },
            }
        }
    }
}
