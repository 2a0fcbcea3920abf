//! Utilities for both clients and servers.

use async_std::io::BufRead;
use async_std::net;
use async_std::prelude::*;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::error::Error;
use std::io;
use thiserror::Error as ThisError;
use tracing::error;

/// Our standard `Result` type, with a fully general `Error`.
pub type ChatResult<T> = Result<T, Box<dyn Error + Send + Sync + 'static>>;

/// A frame arrived whose bytes are not valid UTF-8.
///
/// This is a fault in one frame, like bad JSON, not a transport failure;
/// callers checking for `io::Error` to detect a dead connection must not
/// see it as one.
#[derive(Debug, ThisError)]
#[error("frame is not valid UTF-8")]
pub struct InvalidFrame;

/// Given a value that can be serialized, transmit it on `socket`.
///
/// One value becomes one newline-terminated line of JSON, so the receiving
/// side can recover frame boundaries by reading lines.
pub async fn send_as_json<V: Serialize>(socket: &mut net::TcpStream, value: &V) -> ChatResult<()> {
    let mut json = serde_json::to_string(&value)?;
    json.push('\n');
    socket.write_all(json.as_bytes()).await?;
    Ok(())
}

/// Parse a stream of newline-terminated JSON values from `inbound`.
///
/// Each item of the returned stream is one decoded value, or the error
/// that one line produced. A transport error ends up as an `io::Error`
/// item; a line that is not valid JSON for `V` yields a decode error but
/// leaves the stream usable for the next line.
pub fn receive_as_json<S, V>(inbound: S) -> impl Stream<Item = ChatResult<V>>
where
    S: BufRead + Unpin,
    V: DeserializeOwned,
{
    inbound.lines().map(|line| -> ChatResult<V> {
        let line = match line {
            Ok(line) => line,
            // `lines` reports a non-UTF-8 line as an `InvalidData` read
            // error even though the stream is still usable; surface it
            // as a frame fault instead.
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                return Err(InvalidFrame.into())
            }
            Err(err) => return Err(err.into()),
        };
        let value = serde_json::from_str::<V>(&line)?;
        Ok(value)
    })
}

/// Await `future`, and log any error it returns.
pub async fn log_error<F>(future: F)
where
    F: Future<Output = ChatResult<()>>,
{
    if let Err(err) = future.await {
        error!("task failed: {}", err);
    }
}
