use std::rc::Rc;

use futures::channel::mpsc::channel;

use crate::{dispatching::TokioHost, execution::Executor, local::LocalHost};

pub struct Factory;

impl Factory {
    /// A tokio-backed host and the executor that runs its turns. At most
    /// `turn_queue_buffer` turns may wait to be picked up by the executor.
    pub fn tokio(turn_queue_buffer: usize) -> (Rc<TokioHost>, Executor) {
        let (turn_sender, turn_receiver) = channel(turn_queue_buffer);
        (
            Rc::new(TokioHost::new(turn_sender)),
            Executor::new(turn_receiver),
        )
    }

    pub fn local() -> Rc<LocalHost> {
        LocalHost::new()
    }
}
