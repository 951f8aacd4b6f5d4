//! Relay tunnel: plaintext handshake, then one multiplexed session whose
//! logical streams are each forwarded to the local service.

pub mod client;
pub mod forward;
pub mod protocol;
pub mod transport;
