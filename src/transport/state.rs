//! Message state references and connection state events
//!
//! Every delivered message carries a [`TransportStateReference`]: the opaque
//! bundle downstream message-processing and security layers use to correlate
//! a reply path back to the mapping that received the message.
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;

use crate::address::TransportAddress;

/// Security level hints attached to a state reference. The transport layer
/// itself never interprets these; they default to `Undefined` and are filled
/// in by the security subsystem.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SecurityLevel {
    #[default]
    Undefined,
    NoAuthNoPriv,
    AuthNoPriv,
    AuthPriv,
}

/// Handle correlating a delivered message back to the resource that
/// received it: the live socket for real transports, the listen-session
/// counter for the in-memory dummy pair.
#[derive(Clone, Debug, Default)]
pub enum TransportHandle {
    #[default]
    None,
    Socket(Arc<UdpSocket>),
    Session(u64),
}

impl TransportHandle {
    pub fn session_id(&self) -> Option<u64> {
        match self {
            TransportHandle::Session(id) => Some(*id),
            _ => None,
        }
    }
}

/// Opaque reply-correlation bundle attached to every delivered message.
#[derive(Clone, Debug)]
pub struct TransportStateReference {
    /// Local address of the mapping that received the message, when bound.
    pub address: Option<TransportAddress>,
    pub security_name: Option<Bytes>,
    pub requested_security_level: SecurityLevel,
    pub transport_security_level: SecurityLevel,
    pub same_security: bool,
    pub session: TransportHandle,
}

impl TransportStateReference {
    /// A reference with undefined security levels, as the transport layer
    /// produces for every inbound message.
    pub fn new(address: Option<TransportAddress>, session: TransportHandle) -> Self {
        Self {
            address,
            security_name: None,
            requested_security_level: SecurityLevel::Undefined,
            transport_security_level: SecurityLevel::Undefined,
            same_security: false,
            session,
        }
    }
}

/// Connection lifecycle states reported by connection-oriented mappings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Unknown,
    Connected,
    DisconnectedRemotely,
    DisconnectedTimeout,
    Closed,
}

/// Immutable record of a connection state transition.
///
/// Only a `Connected` event is meaningful to cancel: the cancel flag is an
/// advisory signal back to the emitting mapping that the connection attempt
/// should be rejected. The event enforces nothing itself.
#[derive(Debug)]
pub struct TransportStateEvent {
    source: TransportAddress,
    peer_address: TransportAddress,
    new_state: TransportState,
    causing_error: Option<std::io::Error>,
    cancelled: AtomicBool,
}

impl TransportStateEvent {
    pub fn new(
        source: TransportAddress,
        peer_address: TransportAddress,
        new_state: TransportState,
        causing_error: Option<std::io::Error>,
    ) -> Self {
        Self {
            source,
            peer_address,
            new_state,
            causing_error,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn source(&self) -> &TransportAddress {
        &self.source
    }

    pub fn peer_address(&self) -> &TransportAddress {
        &self.peer_address
    }

    pub fn new_state(&self) -> TransportState {
        self.new_state
    }

    pub fn causing_error(&self) -> Option<&std::io::Error> {
        self.causing_error.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn set_cancelled(&self, cancelled: bool) {
        self.cancelled.store(cancelled, Ordering::SeqCst);
    }
}

impl fmt::Display for TransportStateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransportStateEvent[source={}, peer={}, state={:?}, cancelled={}]",
            self.source,
            self.peer_address,
            self.new_state,
            self.is_cancelled()
        )
    }
}
