//! In-memory dummy transport pair
//!
//! Simulates a bidirectional link without any OS socket: the generator side
//! and the responder side share two lock-free FIFO queues. The generator's
//! `send_message` enqueues onto `requests`, which the responder's drain
//! worker delivers to the responder's listeners; the responder replies onto
//! `responses`, drained to the generator's listeners. Delivery is lossless
//! and in order by construction, which makes protocol tests deterministic.
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use crossbeam::queue::SegQueue;
use tokio::time::sleep;
use tracing::debug;

use crate::address::TransportAddress;
use crate::error::Result;
use crate::settings;
use crate::transport::base::ListenerRegistry;
use crate::transport::state::{TransportHandle, TransportStateReference};
use crate::transport::{TransportListener, TransportMapping};
use crate::worker::{StopFlag, WorkerHandle};
use crate::transport_error;

/// Poll interval for an empty queue. A coalesced busy-wait is acceptable
/// here: this is a test double, not a production transport.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug)]
enum QueueRole {
    Requests,
    Responses,
}

/// State shared by both halves of the pair.
struct DummyLink {
    requests: SegQueue<Bytes>,
    responses: SegQueue<Bytes>,
    // Bumped each time either side starts listening; inbound messages are
    // tagged with it for state-reference correlation.
    session_id: AtomicU64,
    listen_address: Mutex<Option<TransportAddress>>,
    receiver_address: Mutex<Option<TransportAddress>>,
}

impl DummyLink {
    fn new(
        listen_address: Option<TransportAddress>,
        receiver_address: Option<TransportAddress>,
    ) -> Arc<Self> {
        Arc::new(Self {
            requests: SegQueue::new(),
            responses: SegQueue::new(),
            session_id: AtomicU64::new(0),
            listen_address: Mutex::new(listen_address),
            receiver_address: Mutex::new(receiver_address),
        })
    }

    fn queue(&self, role: QueueRole) -> &SegQueue<Bytes> {
        match role {
            QueueRole::Requests => &self.requests,
            QueueRole::Responses => &self.responses,
        }
    }

    fn clear(&self, role: QueueRole) {
        while self.queue(role).pop().is_some() {}
    }

    fn listen_address(&self) -> Option<TransportAddress> {
        *lock_ignoring_poison(&self.listen_address)
    }

    fn receiver_address(&self) -> Option<TransportAddress> {
        *lock_ignoring_poison(&self.receiver_address)
    }

    fn next_session(&self) -> u64 {
        self.session_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn unspecified_address() -> TransportAddress {
    TransportAddress::Udp(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
}

/// Drains one queue and fans each message out to the owning side's
/// listeners, tagged with the session in effect when that side started
/// listening.
async fn drain_loop(
    link: Arc<DummyLink>,
    role: QueueRole,
    listeners: Arc<ListenerRegistry>,
    session: u64,
    stop: StopFlag,
) {
    while !stop.is_stopped() {
        match link.queue(role).pop() {
            Some(message) => {
                let peer = link
                    .receiver_address()
                    .unwrap_or_else(unspecified_address);
                let state_ref = TransportStateReference::new(
                    link.listen_address(),
                    TransportHandle::Session(session),
                );
                listeners.fire_process_message(&peer, &message, &state_ref);
            }
            None => sleep(POLL_INTERVAL).await,
        }
    }
    debug!("Worker task stopped: dummy {:?} drain loop", role);
}

fn spawn_drain(
    link: &Arc<DummyLink>,
    role: QueueRole,
    listeners: &Arc<ListenerRegistry>,
    worker_slot: &Mutex<Option<Box<dyn WorkerHandle>>>,
    name: String,
) -> Result<()> {
    let mut slot = lock_ignoring_poison(worker_slot);
    if slot.is_some() {
        return Err(transport_error!("Port already listening"));
    }
    let session = link.next_session();
    let stop = StopFlag::new();
    let task = Box::pin(drain_loop(
        link.clone(),
        role,
        listeners.clone(),
        session,
        stop.clone(),
    ));
    let worker = settings::thread_factory().create_worker_thread(name, task, stop, true);
    *slot = Some(worker);
    Ok(())
}

async fn stop_drain(worker_slot: &Mutex<Option<Box<dyn WorkerHandle>>>) {
    let worker = lock_ignoring_poison(worker_slot).take();
    if let Some(worker) = worker {
        worker.terminate();
        // The drain loop sleeps at most one poll interval, so joining is
        // always bounded.
        worker.join().await;
    }
}

/// Generator half of the in-memory pair.
pub struct DummyTransport {
    link: Arc<DummyLink>,
    listeners: Arc<ListenerRegistry>,
    worker: Mutex<Option<Box<dyn WorkerHandle>>>,
}

impl Default for DummyTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyTransport {
    pub fn new() -> Self {
        Self::with_addresses(None, None)
    }

    pub fn with_listen_address(listen_address: TransportAddress) -> Self {
        Self::with_addresses(Some(listen_address), None)
    }

    pub fn with_addresses(
        listen_address: Option<TransportAddress>,
        receiver_address: Option<TransportAddress>,
    ) -> Self {
        Self {
            link: DummyLink::new(listen_address, receiver_address),
            listeners: Arc::new(ListenerRegistry::new()),
            worker: Mutex::new(None),
        }
    }

    pub fn set_listen_address(&self, listen_address: TransportAddress) {
        *lock_ignoring_poison(&self.link.listen_address) = Some(listen_address);
    }

    /// Returns the responder half, fixing the receiver address messages are
    /// delivered under on both sides.
    pub fn responder(&self, receiver_address: TransportAddress) -> DummyTransportResponder {
        *lock_ignoring_poison(&self.link.receiver_address) = Some(receiver_address);
        DummyTransportResponder {
            link: self.link.clone(),
            listeners: Arc::new(ListenerRegistry::new()),
            worker: Mutex::new(None),
        }
    }

    /// The session counter value; the tag of the most recent `listen()`.
    pub fn session_id(&self) -> u64 {
        self.link.session_id.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportMapping for DummyTransport {
    fn supports_address(&self, _address: &TransportAddress) -> bool {
        // The dummy link carries any IP-based address transparently.
        true
    }

    fn listen_address(&self) -> Option<TransportAddress> {
        self.link.listen_address()
    }

    fn max_inbound_message_size(&self) -> usize {
        settings::DEFAULT_MAX_INBOUND_MESSAGE_SIZE
    }

    fn is_listening(&self) -> bool {
        lock_ignoring_poison(&self.worker).is_some()
    }

    fn add_transport_listener(&self, listener: Arc<dyn TransportListener>) {
        self.listeners.add(listener);
    }

    fn remove_transport_listener(&self, listener: &Arc<dyn TransportListener>) {
        self.listeners.remove(listener);
    }

    async fn send_message(
        &self,
        target: &TransportAddress,
        message: &[u8],
        _state_ref: &TransportStateReference,
    ) -> Result<()> {
        debug!(
            "Send request message to '{}' with length {}",
            target,
            message.len()
        );
        self.link
            .queue(QueueRole::Requests)
            .push(Bytes::copy_from_slice(message));
        Ok(())
    }

    async fn listen(&self) -> Result<()> {
        spawn_drain(
            &self.link,
            QueueRole::Responses,
            &self.listeners,
            &self.worker,
            format!(
                "DummyTransport_{}",
                self.link
                    .listen_address()
                    .unwrap_or_else(unspecified_address)
            ),
        )
    }

    async fn close(&self) {
        stop_drain(&self.worker).await;
        // Drop anything the responder produced but this side never
        // consumed, so it cannot leak into a future session.
        self.link.clear(QueueRole::Responses);
    }
}

/// Responder half of the in-memory pair, obtained via
/// [`DummyTransport::responder`].
pub struct DummyTransportResponder {
    link: Arc<DummyLink>,
    listeners: Arc<ListenerRegistry>,
    worker: Mutex<Option<Box<dyn WorkerHandle>>>,
}

#[async_trait]
impl TransportMapping for DummyTransportResponder {
    fn supports_address(&self, _address: &TransportAddress) -> bool {
        true
    }

    fn listen_address(&self) -> Option<TransportAddress> {
        self.link.receiver_address()
    }

    fn max_inbound_message_size(&self) -> usize {
        settings::DEFAULT_MAX_INBOUND_MESSAGE_SIZE
    }

    fn is_listening(&self) -> bool {
        lock_ignoring_poison(&self.worker).is_some()
    }

    fn add_transport_listener(&self, listener: Arc<dyn TransportListener>) {
        self.listeners.add(listener);
    }

    fn remove_transport_listener(&self, listener: &Arc<dyn TransportListener>) {
        self.listeners.remove(listener);
    }

    async fn send_message(
        &self,
        target: &TransportAddress,
        message: &[u8],
        _state_ref: &TransportStateReference,
    ) -> Result<()> {
        debug!(
            "Send response message to '{}' with length {}",
            target,
            message.len()
        );
        self.link
            .queue(QueueRole::Responses)
            .push(Bytes::copy_from_slice(message));
        Ok(())
    }

    async fn listen(&self) -> Result<()> {
        spawn_drain(
            &self.link,
            QueueRole::Requests,
            &self.listeners,
            &self.worker,
            format!(
                "DummyResponseTransport_{}",
                self.link
                    .receiver_address()
                    .unwrap_or_else(unspecified_address)
            ),
        )
    }

    async fn close(&self) {
        stop_drain(&self.worker).await;
        // Symmetric hygiene: drop unconsumed generator requests.
        self.link.clear(QueueRole::Requests);
    }
}
