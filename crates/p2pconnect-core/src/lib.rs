//! P2P Connect Core - paired sender/receiver transfer protocol
//!
//! Two devices connected over a point-to-point [`PeerSession`] exchange one
//! ordered batch of named resources. The sender negotiates a protocol
//! version, a transfer id (which the receiving side must consent to) and a
//! resource count, then streams the resources strictly in batch order.
//!
//! Discovery, connection establishment and presentation are supplied by the
//! caller through the [`Connector`], [`Advertiser`], [`Notifier`] and
//! [`ProgressSink`] seams.

pub mod config;
pub mod error;
pub mod message;
pub mod notifier;
pub mod progress;
pub mod receiver;
pub mod resource;
pub mod sender;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;


// Re-export commonly used types
pub use config::TransferConfig;
pub use error::{ReceiveError, SendError, SessionError};
pub use message::ProtocolMessage;
pub use notifier::{ChannelNotifier, Notifier, ReceiverEvent};
pub use progress::{Progress, ProgressSink};
pub use receiver::{ReceiverHandle, ReceiverMachine, ReceiverState};
pub use resource::{ResourceDescriptor, TransferBatch, TransferResult};
pub use sender::{SendOutcome, SenderMachine, SenderState};
pub use session::{
    Advertiser, BoundSession, Connector, PeerSession, PeerState, ResourceTransfer,
    ResourceUpdate, SessionEvent,
};
