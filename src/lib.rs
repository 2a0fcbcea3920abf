//! Protocol types shared by the chat relay server and its clients.
//!
//! Every message exchanged over a connection is one [`Envelope`],
//! serialized as a single line of JSON. On the wire an envelope carries a
//! numeric `kind` code plus whichever optional fields that kind uses; in
//! Rust it is a sum type so dispatch is exhaustive at compile time.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cache;
pub mod client;
pub mod utils;

/// Wire codes for each envelope kind. These values are part of the
/// protocol and must not change.
pub mod kind {
    pub const PLAIN: u8 = 0;
    pub const CONNECT: u8 = 1;
    pub const DISCONNECT: u8 = 2;
    pub const LOGIN_REQUEST: u8 = 10;
    pub const LOGIN_REPLY: u8 = 11;
    pub const ROSTER: u8 = 20;
}

/// One online user: a unique id assigned by the server plus the display
/// name the client asked for. Routing goes by `unique_id` only; names are
/// display-only and not guaranteed unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub unique_id: u32,
    pub name: String,
}

impl User {
    pub fn new(unique_id: u32, name: impl Into<String>) -> User {
        User {
            unique_id,
            name: name.into(),
        }
    }
}

/// A message exchanged between a client and the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Frame", try_from = "Frame")]
pub enum Envelope {
    /// A chat message from one user to another, relayed by the server.
    Plain { from: User, to: User, text: String },

    /// Reserved; unused in the minimal flow.
    Connect,

    /// The client with the given id is leaving.
    Disconnect { user_id: u32 },

    /// Please register this display name and assign me an id.
    LoginRequest { name: String },

    /// The server's answer to a login: the assigned id.
    LoginReply { user_id: u32 },

    /// The full list of online users. Replaces, never merges with, the
    /// receiver's previous view.
    Roster { users: Vec<User> },
}

/// Error decoding a frame into an [`Envelope`].
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("unknown envelope kind {0}")]
    UnknownKind(u8),

    #[error("envelope kind {kind} is missing its `{field}` field")]
    MissingField { kind: u8, field: &'static str },

    #[error("envelope kind {kind} carries a non-numeric id: {text:?}")]
    BadId { kind: u8, text: String },
}

/// The on-the-wire shape of an envelope: a kind code plus optional
/// payload fields. Fields a kind does not use are omitted entirely.
#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    users: Option<Vec<User>>,
}

impl Frame {
    fn bare(kind: u8) -> Frame {
        Frame {
            kind,
            text: None,
            from: None,
            to: None,
            users: None,
        }
    }

    fn with_text(kind: u8, text: String) -> Frame {
        Frame {
            text: Some(text),
            ..Frame::bare(kind)
        }
    }
}

impl From<Envelope> for Frame {
    fn from(envelope: Envelope) -> Frame {
        match envelope {
            Envelope::Plain { from, to, text } => Frame {
                from: Some(from),
                to: Some(to),
                ..Frame::with_text(kind::PLAIN, text)
            },
            Envelope::Connect => Frame::bare(kind::CONNECT),
            // Disconnects and login replies carry the id as decimal text.
            Envelope::Disconnect { user_id } => {
                Frame::with_text(kind::DISCONNECT, user_id.to_string())
            }
            Envelope::LoginRequest { name } => Frame::with_text(kind::LOGIN_REQUEST, name),
            Envelope::LoginReply { user_id } => {
                Frame::with_text(kind::LOGIN_REPLY, user_id.to_string())
            }
            Envelope::Roster { users } => Frame {
                users: Some(users),
                ..Frame::bare(kind::ROSTER)
            },
        }
    }
}

impl TryFrom<Frame> for Envelope {
    type Error = EnvelopeError;

    fn try_from(frame: Frame) -> Result<Envelope, EnvelopeError> {
        fn required<T>(
            value: Option<T>,
            kind: u8,
            field: &'static str,
        ) -> Result<T, EnvelopeError> {
            value.ok_or(EnvelopeError::MissingField { kind, field })
        }

        fn id_text(value: Option<String>, kind: u8) -> Result<u32, EnvelopeError> {
            let text = required(value, kind, "text")?;
            text.parse().map_err(|_| EnvelopeError::BadId { kind, text })
        }

        match frame.kind {
            kind::PLAIN => Ok(Envelope::Plain {
                from: required(frame.from, kind::PLAIN, "from")?,
                to: required(frame.to, kind::PLAIN, "to")?,
                text: required(frame.text, kind::PLAIN, "text")?,
            }),
            kind::CONNECT => Ok(Envelope::Connect),
            kind::DISCONNECT => Ok(Envelope::Disconnect {
                user_id: id_text(frame.text, kind::DISCONNECT)?,
            }),
            kind::LOGIN_REQUEST => Ok(Envelope::LoginRequest {
                name: required(frame.text, kind::LOGIN_REQUEST, "text")?,
            }),
            kind::LOGIN_REPLY => Ok(Envelope::LoginReply {
                user_id: id_text(frame.text, kind::LOGIN_REPLY)?,
            }),
            kind::ROSTER => Ok(Envelope::Roster {
                users: required(frame.users, kind::ROSTER, "users")?,
            }),
            other => Err(EnvelopeError::UnknownKind(other)),
        }
    }
}
