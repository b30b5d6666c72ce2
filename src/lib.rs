//! # Kingfisher
//!
//! Transport mappings for a network-management protocol engine: an
//! address-typed endpoint abstraction that lets the engine send and receive
//! datagrams without knowing the concrete medium.
//!
//! A protocol engine obtains a [`transport::TransportMapping`] (directly or
//! through the [`transport::TransportMappings`] registry), registers itself
//! as a [`transport::TransportListener`], calls `listen()` to start
//! receiving, `send_message` to transmit, and `close()` to tear down.
//! Inbound data flows socket (or queue) → receive worker → buffer + state
//! reference → fan-out to every registered listener.

pub mod address;
pub mod error;
pub mod settings;
pub mod transport;
pub mod worker;

pub use address::{AddressKind, TransportAddress};
pub use error::{KingfisherError, Result};
pub use transport::{TransportListener, TransportMapping};
