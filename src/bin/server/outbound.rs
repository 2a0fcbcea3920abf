//! The single writer for one client's socket.
//!
//! Several handlers may want to write to the same client at once: its own
//! handler (login replies), other users' handlers forwarding chat
//! messages, and anyone broadcasting a roster. Funnelling every envelope
//! through one queue drained by one task keeps frames from interleaving
//! on the wire.

use async_std::channel::{self, TrySendError};
use async_std::net;
use async_std::task;
use chat_relay::utils::{self, ChatResult};
use chat_relay::Envelope;
use tracing::warn;

/// Returned when the client's writer task has already exited; the caller
/// should treat the client as gone.
#[derive(Debug)]
pub struct Disconnected;

/// The enqueuing end of one client's outbound queue.
#[derive(Clone)]
pub struct Outbound(channel::Sender<Envelope>);

impl Outbound {
    /// Start a writer task for `socket` and return the queue feeding it.
    pub fn new(socket: net::TcpStream) -> Outbound {
        let (enqueue, dequeue) = channel::bounded(32);
        task::spawn(utils::log_error(run_writer(dequeue, socket)));
        Outbound(enqueue)
    }

    /// Enqueue `envelope` for transmission. Never blocks: a slow client
    /// loses messages rather than stalling whoever is forwarding to it.
    pub fn send(&self, envelope: Envelope) -> Result<(), Disconnected> {
        match self.0.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(envelope)) => {
                warn!("outbound queue full; dropping {:?}", envelope);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(Disconnected),
        }
    }
}

async fn run_writer(
    dequeue: channel::Receiver<Envelope>,
    mut socket: net::TcpStream,
) -> ChatResult<()> {
    while let Ok(envelope) = dequeue.recv().await {
        utils::send_as_json(&mut socket, &envelope).await?;
    }
    Ok(())
}
