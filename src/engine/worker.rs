//! The single outgoing-send worker.
//!
//! Every packet group sent by any connection goes through one FIFO queue and
//! is written by one background task, so compression and encryption state is
//! only ever touched by that task on the send side.
//!
//! ```text
//!  send_packet_group ──┐
//!  send_packet_group ──┼──> SendQueue (FIFO) ──> drain_loop ──> process_sending
//!  flush_joined      ──┘          │
//!                                 └── drained flag (watch) <── wait_for_all_sent
//! ```

use crate::connection::Connection;
use crate::group::PacketGroup;
use crate::lock;
use crate::protocol::Protocol;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tracing::{debug, trace};

/// One pending send: a group bound to the connection it goes to.
pub struct OutgoingMessage<P: Protocol> {
    pub conn: Arc<Connection<P>>,
    pub group: Arc<PacketGroup>,
}

/// FIFO of pending sends shared between the engine and its worker.
pub(crate) struct SendQueue<P: Protocol> {
    messages: Mutex<VecDeque<OutgoingMessage<P>>>,
    /// Wakes the worker when a message is pushed
    notify: Notify,
    /// True whenever the worker found the queue empty after its last item
    drained: watch::Sender<bool>,
}

impl<P: Protocol> SendQueue<P> {
    pub(crate) fn new() -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            drained: watch::Sender::new(true),
        }
    }

    pub(crate) fn push(&self, message: OutgoingMessage<P>) {
        {
            let mut messages = lock(&self.messages);
            messages.push_back(message);
            // Updated under the queue lock so it cannot race with pop()
            self.drained.send_replace(false);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<OutgoingMessage<P>> {
        let mut messages = lock(&self.messages);
        let message = messages.pop_front();
        if message.is_none() {
            self.drained.send_replace(true);
        }
        message
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.messages).len()
    }

    pub(crate) fn subscribe_drained(&self) -> watch::Receiver<bool> {
        self.drained.subscribe()
    }
}

/// Drains the send queue until shutdown is signalled.
///
/// Shutdown is checked between items: a send in progress completes, the rest
/// of the queue is left behind.
pub(crate) async fn drain_loop<P: Protocol>(
    queue: Arc<SendQueue<P>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            debug!(pending = queue.len(), "Send worker received shutdown signal");
            return;
        }

        match queue.pop() {
            Some(message) => {
                trace!(conn = %message.conn.id(), "Processing outgoing packet group");
                message.conn.process_sending(&message.group).await;
            }
            None => {
                tokio::select! {
                    _ = queue.notify.notified() => {}
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            debug!("Send worker received shutdown signal");
                            return;
                        }
                    }
                }
            }
        }
    }
}
