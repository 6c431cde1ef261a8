//! Handshake command codec.
//!
//! Every command is a single UTF-8 text frame: a 4-byte ASCII tag (`ver.`,
//! `tid.`, `cnt.`) followed either by a payload or by the literal `accept` /
//! `deny` suffix.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const VERSION_TAG: &str = "ver.";
pub const TRANSFER_ID_TAG: &str = "tid.";
pub const COUNT_TAG: &str = "cnt.";

const TAG_LEN: usize = 4;
const ACCEPT: &str = "accept";
const DENY: &str = "deny";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    Version(String),
    VersionAccept,
    VersionDeny,
    TransferId(String),
    TransferIdAccept,
    TransferIdDeny,
    Count(usize),
    CountAccept,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("command too short: {0:?}")]
    TooShort(String),
    #[error("unknown command tag {0:?}")]
    UnknownTag(String),
    #[error("{0:?} cannot be denied")]
    UnexpectedDeny(String),
}

impl ProtocolMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            ProtocolMessage::Version(_)
            | ProtocolMessage::VersionAccept
            | ProtocolMessage::VersionDeny => VERSION_TAG,
            ProtocolMessage::TransferId(_)
            | ProtocolMessage::TransferIdAccept
            | ProtocolMessage::TransferIdDeny => TRANSFER_ID_TAG,
            ProtocolMessage::Count(_) | ProtocolMessage::CountAccept => COUNT_TAG,
        }
    }

    /// Wire form of the command.
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ProtocolMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = self.tag();
        match self {
            ProtocolMessage::Version(v) => write!(f, "{tag}{v}"),
            ProtocolMessage::TransferId(id) => write!(f, "{tag}{id}"),
            ProtocolMessage::Count(n) => write!(f, "{tag}{n}"),
            ProtocolMessage::VersionAccept
            | ProtocolMessage::TransferIdAccept
            | ProtocolMessage::CountAccept => write!(f, "{tag}{ACCEPT}"),
            ProtocolMessage::VersionDeny | ProtocolMessage::TransferIdDeny => {
                write!(f, "{tag}{DENY}")
            }
        }
    }
}

impl FromStr for ProtocolMessage {
    type Err = MessageError;

    /// The `accept`/`deny` suffixes take precedence over payloads, so a
    /// transfer id of literally `accept` cannot be expressed. A count payload
    /// that is not a non-negative integer reads as zero.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.len() < TAG_LEN || !input.is_char_boundary(TAG_LEN) {
            return Err(MessageError::TooShort(input.to_string()));
        }
        let (tag, payload) = input.split_at(TAG_LEN);

        let msg = match (tag, payload) {
            (VERSION_TAG, ACCEPT) => ProtocolMessage::VersionAccept,
            (VERSION_TAG, DENY) => ProtocolMessage::VersionDeny,
            (VERSION_TAG, v) => ProtocolMessage::Version(v.to_string()),
            (TRANSFER_ID_TAG, ACCEPT) => ProtocolMessage::TransferIdAccept,
            (TRANSFER_ID_TAG, DENY) => ProtocolMessage::TransferIdDeny,
            (TRANSFER_ID_TAG, id) => ProtocolMessage::TransferId(id.to_string()),
            (COUNT_TAG, ACCEPT) => ProtocolMessage::CountAccept,
            (COUNT_TAG, DENY) => return Err(MessageError::UnexpectedDeny(input.to_string())),
            (COUNT_TAG, n) => ProtocolMessage::Count(n.trim().parse().unwrap_or_else(|_| {
                tracing::warn!("Malformed resource count {:?}, assuming 0", n);
                0
            })),
            _ => return Err(MessageError::UnknownTag(tag.to_string())),
        };
        Ok(msg)
    }
}
