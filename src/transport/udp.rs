//! UDP transport mapping
//!
//! Full duplex UDP endpoint with exactly one background receive worker.
//! The socket is owned exclusively by the mapping: created lazily by
//! `ensure_socket`, renewed through the [`RenewSocketPolicy`] after a
//! socket-level fault, and cleared exactly once on `close()` or fatal
//! receive failure (both paths take the same lock).
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, warn};

use crate::address::{AddressKind, TransportAddress};
use crate::error::{KingfisherError, Result};
use crate::settings;
use crate::transport::base::ListenerRegistry;
use crate::transport::state::{TransportHandle, TransportStateReference};
use crate::transport::{TransportListener, TransportMapping};
use crate::worker::{StopFlag, WorkerHandle, NORM_PRIORITY};
use crate::{config_error, transport_error};

/// Recovery policy invoked when the receive loop hits a socket-level fault.
///
/// The default policy abandons the failed socket and binds a fresh one to
/// the mapping's configured local address. A policy error terminates the
/// receive loop with that error.
#[async_trait]
pub trait RenewSocketPolicy: Send + Sync {
    async fn renew(
        &self,
        error: &io::Error,
        local_addr: SocketAddr,
        reuse_address: bool,
    ) -> Result<UdpSocket>;
}

/// Default renewal: rebind to the configured local address. The failed
/// socket closes when its last handle is dropped by the caller.
pub struct RebindRenewPolicy;

#[async_trait]
impl RenewSocketPolicy for RebindRenewPolicy {
    async fn renew(
        &self,
        error: &io::Error,
        local_addr: SocketAddr,
        reuse_address: bool,
    ) -> Result<UdpSocket> {
        warn!(
            "Renewing socket bound to {} after error: {}",
            local_addr, error
        );
        bind_socket(local_addr, reuse_address)
    }
}

fn bind_socket(addr: SocketAddr, reuse_address: bool) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| KingfisherError::Transport(format!("Socket creation failed: {}", e)))?;
    if reuse_address {
        socket
            .set_reuse_address(true)
            .map_err(|e| KingfisherError::Transport(format!("Socket creation failed: {}", e)))?;
    }
    socket
        .set_nonblocking(true)
        .map_err(|e| KingfisherError::Transport(format!("Socket creation failed: {}", e)))?;
    socket
        .bind(&addr.into())
        .map_err(|e| KingfisherError::Transport(format!("Socket bind failed: {}", e)))?;
    UdpSocket::from_std(socket.into())
        .map_err(|e| KingfisherError::Transport(format!("Socket creation failed: {}", e)))
}

struct UdpInner {
    // Requested bind address; port 0 means a fresh ephemeral port on each
    // (re)bind.
    bind_address: SocketAddr,
    reuse_address: bool,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    worker: Mutex<Option<Box<dyn WorkerHandle>>>,
    listeners: ListenerRegistry,
    max_inbound_message_size: AtomicUsize,
    // Milliseconds; 0 means an infinite receive timeout.
    socket_timeout_millis: AtomicU64,
    // Bytes; 0 means the OS default is kept.
    receive_buffer_size: AtomicUsize,
    renew_policy: Arc<dyn RenewSocketPolicy>,
}

impl UdpInner {
    fn lock_socket(&self) -> MutexGuard<'_, Option<Arc<UdpSocket>>> {
        self.socket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Box<dyn WorkerHandle>>> {
        self.worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the live socket, creating and binding one if none exists.
    /// The single critical section makes lazy recreation safe against
    /// concurrent `listen()`/`close()`.
    fn ensure_socket(&self) -> Result<Arc<UdpSocket>> {
        let mut guard = self.lock_socket();
        if let Some(socket) = guard.as_ref() {
            return Ok(socket.clone());
        }
        let socket = Arc::new(bind_socket(self.bind_address, self.reuse_address)?);
        *guard = Some(socket.clone());
        Ok(socket)
    }

    fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_millis.load(Ordering::SeqCst))
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.lock_socket()
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }
}

/// UDP [`TransportMapping`] with an internal worker listening on the
/// inbound socket.
pub struct UdpTransport {
    inner: Arc<UdpInner>,
}

impl UdpTransport {
    /// Creates a UDP transport bound to an ephemeral port on the loopback
    /// interface.
    pub async fn new() -> Result<Self> {
        Self::with_address_reuse("udp:127.0.0.1:0".parse()?, false).await
    }

    /// Creates a UDP transport bound to `address`. The address is not
    /// reused if it is still in TIME_WAIT.
    pub async fn with_address(address: TransportAddress) -> Result<Self> {
        Self::with_address_reuse(address, false).await
    }

    /// Creates a UDP transport bound to `address`, optionally with
    /// `SO_REUSEADDR` for faster rebinding after a restart.
    pub async fn with_address_reuse(
        address: TransportAddress,
        reuse_address: bool,
    ) -> Result<Self> {
        if address.kind() != AddressKind::Udp {
            return Err(transport_error!(
                "UdpTransport cannot bind a {} address",
                address.kind()
            ));
        }
        let bind_address = address.socket_addr();
        // Bind eagerly so construction fails fast on an unusable address.
        let socket = Arc::new(bind_socket(bind_address, reuse_address)?);
        Ok(Self {
            inner: Arc::new(UdpInner {
                bind_address,
                reuse_address,
                socket: Mutex::new(Some(socket)),
                worker: Mutex::new(None),
                listeners: ListenerRegistry::new(),
                max_inbound_message_size: AtomicUsize::new(
                    settings::DEFAULT_MAX_INBOUND_MESSAGE_SIZE,
                ),
                socket_timeout_millis: AtomicU64::new(0),
                receive_buffer_size: AtomicUsize::new(0),
                renew_policy: Arc::new(RebindRenewPolicy),
            }),
        })
    }

    /// Replaces the socket-failure recovery policy. Must be applied right
    /// after construction, before `listen()` shares the state with a
    /// worker.
    pub fn with_renew_policy(mut self, policy: Arc<dyn RenewSocketPolicy>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.renew_policy = policy;
        }
        self
    }

    pub fn set_max_inbound_message_size(&self, size: usize) {
        self.inner
            .max_inbound_message_size
            .store(size, Ordering::SeqCst);
    }

    /// The configured receive timeout. `Duration::ZERO` means infinite.
    pub fn socket_timeout(&self) -> Duration {
        self.inner.socket_timeout()
    }

    /// Sets the receive timeout; zero disables it. A running receive loop
    /// picks the new value up on its next iteration.
    pub fn set_socket_timeout(&self, timeout: Duration) {
        self.inner
            .socket_timeout_millis
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
    }

    /// The requested receive buffer size; 0 when the OS default is kept.
    pub fn receive_buffer_size(&self) -> usize {
        self.inner.receive_buffer_size.load(Ordering::SeqCst)
    }

    /// Requests an OS receive buffer size, applied at the next `listen()`.
    /// Must be greater than zero.
    pub fn set_receive_buffer_size(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(config_error!("Receive buffer size must be > 0"));
        }
        self.inner.receive_buffer_size.store(size, Ordering::SeqCst);
        Ok(())
    }

    /// Changes the receive worker's advisory priority. No effect before
    /// `listen()`.
    pub fn set_priority(&self, priority: i32) {
        if let Some(worker) = self.inner.lock_worker().as_ref() {
            worker.set_priority(priority);
        }
    }

    pub fn priority(&self) -> i32 {
        self.inner
            .lock_worker()
            .as_ref()
            .map(|worker| worker.priority())
            .unwrap_or(NORM_PRIORITY)
    }

    /// Renames the receive worker. No effect before `listen()`.
    pub fn set_thread_name(&self, name: &str) {
        if let Some(worker) = self.inner.lock_worker().as_ref() {
            worker.set_name(name);
        }
    }

    /// The receive worker's name, or `None` when not listening.
    pub fn thread_name(&self) -> Option<String> {
        self.inner
            .lock_worker()
            .as_ref()
            .map(|worker| worker.name())
    }
}

#[async_trait]
impl TransportMapping for UdpTransport {
    fn supports_address(&self, address: &TransportAddress) -> bool {
        address.kind() == AddressKind::Udp
    }

    fn listen_address(&self) -> Option<TransportAddress> {
        // Derived from the live socket, so an ephemeral-port request reads
        // back as the actual bound port.
        self.inner.local_address().map(TransportAddress::Udp)
    }

    fn max_inbound_message_size(&self) -> usize {
        self.inner.max_inbound_message_size.load(Ordering::SeqCst)
    }

    fn is_listening(&self) -> bool {
        self.inner.lock_worker().is_some()
    }

    fn add_transport_listener(&self, listener: Arc<dyn TransportListener>) {
        self.inner.listeners.add(listener);
    }

    fn remove_transport_listener(&self, listener: &Arc<dyn TransportListener>) {
        self.inner.listeners.remove(listener);
    }

    async fn send_message(
        &self,
        target: &TransportAddress,
        message: &[u8],
        _state_ref: &TransportStateReference,
    ) -> Result<()> {
        if !self.supports_address(target) {
            return Err(transport_error!(
                "UdpTransport cannot send to a {} address",
                target.kind()
            ));
        }
        debug!(
            "Sending message to {} with length {}",
            target,
            message.len()
        );
        let socket = self.inner.ensure_socket()?;
        socket
            .send_to(message, target.socket_addr())
            .await
            .map_err(KingfisherError::Io)?;
        Ok(())
    }

    async fn listen(&self) -> Result<()> {
        let socket = self.inner.ensure_socket()?;
        let mut worker_slot = self.inner.lock_worker();
        if worker_slot.is_some() {
            return Err(transport_error!("Port already listening"));
        }
        let stop = StopFlag::new();
        let task = Box::pin(receive_loop(
            self.inner.clone(),
            socket.clone(),
            stop.clone(),
        ));
        let name = format!(
            "UdpTransport_{}",
            socket
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| self.inner.bind_address.to_string())
        );
        let worker = settings::thread_factory().create_worker_thread(name, task, stop, true);
        *worker_slot = Some(worker);
        Ok(())
    }

    async fn close(&self) {
        let worker = self.inner.lock_worker().take();
        if let Some(worker) = worker {
            worker.terminate();
            worker.interrupt();
            // With an infinite receive timeout the loop may be parked in a
            // receive; shutdown is then fire-and-forget and the worker
            // exits once its blocking receive unblocks or is cancelled.
            if !self.inner.socket_timeout().is_zero() {
                worker.join().await;
            }
        }
        // Take-and-drop: the socket closes once the receive loop's own
        // handle is gone too.
        self.inner.lock_socket().take();
    }
}

/// The receive loop. Runs as one background worker per listening mapping;
/// exits when stopped, on a fatal socket fault, or on failed renewal.
async fn receive_loop(inner: Arc<UdpInner>, socket: Arc<UdpSocket>, stop: StopFlag) {
    let mut socket = socket;
    let max_inbound = inner.max_inbound_message_size.load(Ordering::SeqCst);

    let requested_buffer = inner.receive_buffer_size.load(Ordering::SeqCst);
    if requested_buffer > 0 {
        let size = requested_buffer.max(max_inbound);
        match SockRef::from(socket.as_ref()).set_recv_buffer_size(size) {
            Ok(()) => debug!(
                "UDP receive buffer size for socket {:?} is set to: {}",
                socket.local_addr().ok(),
                size
            ),
            Err(e) => {
                // Non-fatal: keep listening with OS defaults, and drop the
                // read timeout so the loop does not spin on a socket whose
                // options could not be applied.
                error!("Failed to set receive buffer size: {}", e);
                inner.socket_timeout_millis.store(0, Ordering::SeqCst);
            }
        }
    }

    // One spare byte past the ceiling detects oversized datagrams.
    let mut buf = vec![0u8; max_inbound + 1];

    while !stop.is_stopped() {
        let timeout = inner.socket_timeout();
        let received = if timeout.is_zero() {
            socket.recv_from(&mut buf).await
        } else {
            match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
                // Read timeout elapsed: silently retry.
                Err(_elapsed) => continue,
                Ok(result) => result,
            }
        };

        match received {
            Ok((len, peer)) => {
                if len > max_inbound {
                    warn!(
                        "Dropping datagram from {} longer than the inbound ceiling ({} > {})",
                        peer, len, max_inbound
                    );
                    continue;
                }
                debug!("Received message from {} with length {}", peer, len);
                // Always copy before fan-out: listeners may hand the
                // message to other tasks, and the shared receive buffer is
                // overwritten on the next iteration.
                let message = buf[..len].to_vec();
                let state_ref = TransportStateReference::new(
                    socket.local_addr().ok().map(TransportAddress::Udp),
                    TransportHandle::Socket(socket.clone()),
                );
                inner.listeners.fire_process_message(
                    &TransportAddress::Udp(peer),
                    &message,
                    &state_ref,
                );
            }
            // Interrupted with nothing read: transient, retry.
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                // ICMP port unreachable: fatal for this mapping. There is
                // no caller to notify; the worker exits abnormally.
                error!(
                    "Port unreachable on transport mapping {}: {}",
                    inner.bind_address, err
                );
                break;
            }
            Err(err) => {
                if stop.is_stopped() {
                    break;
                }
                warn!(
                    "Socket for transport mapping {} error: {}",
                    inner.bind_address, err
                );
                match renew_socket(&inner, &err).await {
                    Some(new_socket) => socket = new_socket,
                    None => break,
                }
            }
        }
    }

    stop.stop();
    release_loop_state(&inner, &socket);
    debug!("Worker task stopped: udp receive loop");
}

/// Runs the renewal policy after a socket-level fault. On success the
/// mapping's socket slot is swapped to the fresh socket, which is returned
/// for the loop to continue on; on failure the loop must terminate.
async fn renew_socket(inner: &Arc<UdpInner>, error: &io::Error) -> Option<Arc<UdpSocket>> {
    let renewed = inner
        .renew_policy
        .renew(error, inner.bind_address, inner.reuse_address)
        .await;
    match renewed {
        Ok(new_socket) => {
            let new_socket = Arc::new(new_socket);
            *inner.lock_socket() = Some(new_socket.clone());
            Some(new_socket)
        }
        Err(renew_err) => {
            error!(
                "Socket renewal for transport mapping {} failed: {}",
                inner.bind_address, renew_err
            );
            None
        }
    }
}

/// Loop-exit cleanup: clears the worker and socket slots under the same
/// locks `close()` uses, but only while this loop's socket is still the
/// mapping's current one. After a non-joining close() a successor
/// `listen()` may already own the slots; its state must survive the old
/// loop's exit.
fn release_loop_state(inner: &UdpInner, socket: &Arc<UdpSocket>) {
    let mut socket_slot = inner.lock_socket();
    let current = socket_slot
        .as_ref()
        .map_or(false, |s| Arc::ptr_eq(s, socket));
    if current {
        socket_slot.take();
        drop(socket_slot);
        inner.lock_worker().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::time::{sleep, timeout, Duration};

    struct CollectingListener {
        seen: StdMutex<Vec<(TransportAddress, Vec<u8>)>>,
    }

    impl CollectingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: StdMutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<(TransportAddress, Vec<u8>)> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl TransportListener for CollectingListener {
        fn process_message(
            &self,
            peer: &TransportAddress,
            message: &[u8],
            state_ref: &TransportStateReference,
        ) {
            assert!(matches!(state_ref.session, TransportHandle::Socket(_)));
            self.seen.lock().unwrap().push((*peer, message.to_vec()));
        }
    }

    #[tokio::test]
    async fn test_ephemeral_bind_reads_back_actual_port() {
        let transport = UdpTransport::new().await.unwrap();
        let addr = transport.listen_address().expect("socket should be bound");
        assert_eq!(addr.kind(), AddressKind::Udp);
        assert!(addr.port() > 0);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let first = UdpTransport::new().await.unwrap();
        let taken = first.listen_address().unwrap();
        let second = UdpTransport::with_address(taken).await;
        // Double-binding the same port without SO_REUSEADDR fails fast.
        assert!(matches!(second, Err(KingfisherError::Transport(_))));
    }

    #[tokio::test]
    async fn test_listen_twice_fails() {
        let transport = UdpTransport::new().await.unwrap();
        transport.listen().await.unwrap();
        let again = transport.listen().await;
        assert!(matches!(again, Err(KingfisherError::Transport(_))));
        transport.close().await;
    }

    #[tokio::test]
    async fn test_send_rejects_wrong_address_kind() {
        let transport = UdpTransport::new().await.unwrap();
        let target: TransportAddress = "tcp:127.0.0.1:9000".parse().unwrap();
        let state_ref = TransportStateReference::new(None, TransportHandle::None);
        let result = transport.send_message(&target, b"data", &state_ref).await;
        assert!(matches!(result, Err(KingfisherError::Transport(_))));
    }

    #[tokio::test]
    async fn test_construct_rejects_wrong_address_kind() {
        let result = UdpTransport::with_address("tls:127.0.0.1:0".parse().unwrap()).await;
        assert!(matches!(result, Err(KingfisherError::Transport(_))));
    }

    #[tokio::test]
    async fn test_receive_buffer_size_validation() {
        let transport = UdpTransport::new().await.unwrap();
        assert!(matches!(
            transport.set_receive_buffer_size(0),
            Err(KingfisherError::Config(_))
        ));
        transport.set_receive_buffer_size(1 << 20).unwrap();
        assert_eq!(transport.receive_buffer_size(), 1 << 20);
    }

    #[tokio::test]
    async fn test_thread_controls_are_noops_before_listen() {
        let transport = UdpTransport::new().await.unwrap();
        assert_eq!(transport.thread_name(), None);
        assert_eq!(transport.priority(), NORM_PRIORITY);
        transport.set_priority(8);
        transport.set_thread_name("ignored");
        assert_eq!(transport.thread_name(), None);

        transport.listen().await.unwrap();
        assert!(transport.thread_name().unwrap().starts_with("UdpTransport_"));
        transport.set_thread_name("renamed");
        assert_eq!(transport.thread_name().as_deref(), Some("renamed"));
        transport.set_priority(8);
        assert_eq!(transport.priority(), 8);
        transport.close().await;
    }

    #[tokio::test]
    async fn test_loopback_delivery() {
        let receiver = UdpTransport::new().await.unwrap();
        receiver.set_socket_timeout(Duration::from_millis(50));
        let listener = CollectingListener::new();
        receiver.add_transport_listener(listener.clone());
        receiver.listen().await.unwrap();
        let target = receiver.listen_address().unwrap();

        let sender = UdpTransport::new().await.unwrap();
        let sender_addr = sender.listen_address().unwrap();
        let state_ref = TransportStateReference::new(None, TransportHandle::None);
        sender
            .send_message(&target, b"0123456789", &state_ref)
            .await
            .unwrap();

        let deadline = timeout(Duration::from_secs(2), async {
            loop {
                if !listener.seen().is_empty() {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(deadline.is_ok(), "message was not delivered in time");

        let seen = listener.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, sender_addr);
        assert_eq!(seen[0].1, b"0123456789".to_vec());

        receiver.close().await;
        sender.close().await;
        assert!(!receiver.is_listening());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = UdpTransport::new().await.unwrap();
        transport.set_socket_timeout(Duration::from_millis(20));
        transport.listen().await.unwrap();
        assert!(transport.is_listening());

        transport.close().await;
        assert!(!transport.is_listening());
        transport.close().await;
        assert!(!transport.is_listening());
    }

    struct CountingRenewPolicy {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl RenewSocketPolicy for CountingRenewPolicy {
        async fn renew(
            &self,
            _error: &io::Error,
            local_addr: SocketAddr,
            reuse_address: bool,
        ) -> Result<UdpSocket> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            bind_socket(local_addr, reuse_address)
        }
    }

    struct FailingRenewPolicy;

    #[async_trait]
    impl RenewSocketPolicy for FailingRenewPolicy {
        async fn renew(
            &self,
            _error: &io::Error,
            _local_addr: SocketAddr,
            _reuse_address: bool,
        ) -> Result<UdpSocket> {
            Err(transport_error!("renewal disabled"))
        }
    }

    fn socket_fault() -> io::Error {
        io::Error::new(io::ErrorKind::Other, "simulated socket fault")
    }

    #[tokio::test]
    async fn test_renewal_swaps_in_fresh_socket() {
        let policy = Arc::new(CountingRenewPolicy {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let transport = UdpTransport::new()
            .await
            .unwrap()
            .with_renew_policy(policy.clone());
        let old_socket = transport.inner.ensure_socket().unwrap();

        // A recoverable fault runs the installed policy; the loop continues
        // on the returned socket.
        let renewed = renew_socket(&transport.inner, &socket_fault()).await;
        let new_socket = renewed.expect("renewal should yield a fresh socket");
        assert_eq!(policy.calls.load(Ordering::SeqCst), 1);
        assert!(!Arc::ptr_eq(&old_socket, &new_socket));

        // The mapping's socket slot now holds the renewed socket, so sends
        // and listen_address() follow it too.
        let current = transport.inner.ensure_socket().unwrap();
        assert!(Arc::ptr_eq(&current, &new_socket));
    }

    #[tokio::test]
    async fn test_failed_renewal_terminates_recovery() {
        let transport = UdpTransport::new()
            .await
            .unwrap()
            .with_renew_policy(Arc::new(FailingRenewPolicy));
        let old_socket = transport.inner.ensure_socket().unwrap();

        // A failing policy means no replacement: the loop must exit, and
        // the old socket slot is left for the exit cleanup.
        let renewed = renew_socket(&transport.inner, &socket_fault()).await;
        assert!(renewed.is_none());
        let current = transport.inner.ensure_socket().unwrap();
        assert!(Arc::ptr_eq(&current, &old_socket));
    }

    #[tokio::test]
    async fn test_default_policy_rebinds_configured_address() {
        let transport = UdpTransport::new().await.unwrap();
        let local = transport.listen_address().unwrap().socket_addr();
        // RebindRenewPolicy ignores the failed socket and binds anew; with
        // an ephemeral request the fresh socket gets its own port.
        let renewed = RebindRenewPolicy
            .renew(&socket_fault(), transport.inner.bind_address, false)
            .await
            .unwrap();
        assert_ne!(renewed.local_addr().unwrap(), local);
    }

    #[tokio::test]
    async fn test_loop_exit_cleanup_spares_successor_state() {
        let transport = UdpTransport::new().await.unwrap();
        transport.listen().await.unwrap();
        let current_socket = transport.inner.ensure_socket().unwrap();

        // A stale loop (its socket is no longer the mapping's) must not
        // clear a successor's worker or socket on exit.
        let stale_socket = Arc::new(bind_socket("127.0.0.1:0".parse().unwrap(), false).unwrap());
        release_loop_state(&transport.inner, &stale_socket);
        assert!(transport.is_listening());
        assert!(transport.listen_address().is_some());

        // The current loop's own exit clears both slots.
        release_loop_state(&transport.inner, &current_socket);
        assert!(!transport.is_listening());
        assert!(transport.listen_address().is_none());
    }

    #[tokio::test]
    async fn test_listen_close_cycle_renews_socket() {
        let transport = UdpTransport::new().await.unwrap();
        transport.set_socket_timeout(Duration::from_millis(20));

        transport.listen().await.unwrap();
        assert!(transport.is_listening());
        transport.close().await;
        assert!(!transport.is_listening());
        assert!(transport.listen_address().is_none());

        // A fresh listen() gets a brand-new socket and worker.
        transport.listen().await.unwrap();
        assert!(transport.is_listening());
        assert!(transport.listen_address().is_some());
        transport.close().await;
        assert!(!transport.is_listening());
    }
}
