//! TCP transport for P2P Connect.
//!
//! Implements the [`PeerSession`], [`Connector`] and [`Advertiser`] seams of
//! `p2pconnect-core` over a plain TCP stream carrying length-prefixed
//! bincode frames. Resources are streamed in chunks into a staging
//! directory and verified against a SHA-256 digest before they are
//! reported as received.
//!
//! [`PeerSession`]: p2pconnect_core::PeerSession
//! [`Connector`]: p2pconnect_core::Connector
//! [`Advertiser`]: p2pconnect_core::Advertiser

pub mod frame;
pub mod listener;
pub mod session;

pub use frame::{Frame, CHUNK_SIZE, MAX_FRAME_LEN};
pub use listener::{TcpAdvertiser, TcpConnector};
pub use session::TcpPeerSession;
