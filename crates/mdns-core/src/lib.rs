//! mDNS discovery for P2P Connect.
//!
//! Receivers announce `_p2pconnect._tcp.local.` with their service id and
//! device name in the TXT record; senders browse for that service type and
//! keep only peers advertising the same service id.

pub mod announce;
pub mod discover;
pub mod model;
pub mod net;
pub mod peer;

pub use peer::{MdnsAdvertiser, MdnsConnector};

/// Service type every P2P Connect receiver announces.
pub const SERVICE_TYPE: &str = "_p2pconnect._tcp.local.";

/// TXT key carrying the service id.
pub const TXT_SERVICE: &str = "svc";

/// TXT key carrying the device name.
pub const TXT_DEVICE: &str = "dev";
