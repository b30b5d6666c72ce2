//! Transport mappings
//!
//! A transport mapping owns one communication endpoint: it binds a local
//! address, sends datagrams on request, and runs a single background receive
//! worker that fans inbound messages out to registered listeners. The
//! protocol engine above this layer talks only to the [`TransportMapping`]
//! trait; the concrete medium (UDP here, or the in-memory dummy pair for
//! tests) stays behind it.

pub mod base;
pub mod dummy;
pub mod registry;
pub mod state;
pub mod udp;

use std::sync::Arc;

use async_trait::async_trait;

use crate::address::TransportAddress;
use crate::error::Result;
pub use base::ListenerRegistry;
pub use dummy::{DummyTransport, DummyTransportResponder};
pub use registry::TransportMappings;
pub use state::{
    SecurityLevel, TransportHandle, TransportState, TransportStateEvent,
    TransportStateReference,
};
pub use udp::UdpTransport;

/// Consumer of inbound messages.
///
/// Invoked synchronously, any number of times, on the mapping's own receive
/// worker. Implementations must not block indefinitely: they execute on the
/// time-critical receive path. The origin mapping is identified by the
/// state reference (local address plus socket/session handle).
pub trait TransportListener: Send + Sync {
    fn process_message(
        &self,
        peer: &TransportAddress,
        message: &[u8],
        state_ref: &TransportStateReference,
    );
}

/// The unit of ownership for one communication endpoint.
#[async_trait]
pub trait TransportMapping: Send + Sync {
    /// Whether this mapping can route to/from `address`.
    fn supports_address(&self, address: &TransportAddress) -> bool;

    /// The actual bound local address, or `None` when no socket exists yet.
    fn listen_address(&self) -> Option<TransportAddress>;

    fn max_inbound_message_size(&self) -> usize;

    fn is_listening(&self) -> bool;

    fn add_transport_listener(&self, listener: Arc<dyn TransportListener>);

    fn remove_transport_listener(&self, listener: &Arc<dyn TransportListener>);

    /// Performs a single best-effort write of `message` to `target`. No
    /// retry, no fragmentation: the caller owns message size versus path
    /// MTU and the receiver's inbound ceiling.
    async fn send_message(
        &self,
        target: &TransportAddress,
        message: &[u8],
        state_ref: &TransportStateReference,
    ) -> Result<()>;

    /// Starts the background receive worker. Fails if one is already
    /// running. Returns once the worker has been launched, not once it is
    /// accepting.
    async fn listen(&self) -> Result<()>;

    /// Stops the receive worker and releases the endpoint. Idempotent and
    /// safe to call from any task.
    async fn close(&self);
}
