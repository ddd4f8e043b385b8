//! Multi-peer poll scheduler.
//!
//! A single logical control thread drives [`Engine::poll`]; it is the only
//! code that reads sockets or fires retransmissions. Each call services
//! every registered peer (due-work scan first, then socket drain) and
//! returns at most one application-level event, rotating its round-robin
//! starting point so sustained traffic on one peer cannot starve the rest.
//!
//! Retransmission and reassembly timers are logical: checked against the
//! wall clock at the top of each call, never OS timers. The only
//! cross-thread paths are `cancel()` and `disconnect()`, which set flags
//! that the poll loop applies at a safe point; peer state itself is guarded
//! by a per-peer lock, so a disconnect request never mutates reliability
//! buffers mid-iteration.
//!
//! Cancellation and the poll clock are fields of the engine, not process
//! globals: independent engines coexist and test in isolation.

use super::peer::{Credentials, DisconnectReason, Peer, PeerEvent, PeerState};
use crate::codec::value::FieldValue;
use crate::config::EngineConfig;
use crate::error::{ProtocolError, Result};
use bytes::Bytes;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Upper bound on one readiness wait; keeps cancellation latency bounded
/// even when the caller passes a long poll timeout
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Opaque identifier for a registered peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(usize);

/// Result of one poll cycle: at most one event
#[derive(Debug)]
pub enum PollOutcome<H> {
    Event {
        peer: PeerId,
        /// The host's registration handle, returned untouched
        handle: H,
        event: PeerEvent,
    },
    TimedOut,
}

struct PeerSlot<H> {
    id: PeerId,
    handle: H,
    socket: UdpSocket,
    peer: Mutex<Peer>,
    disconnect_requested: AtomicBool,
}

/// The client engine: a set of peers serviced by one poll loop
pub struct Engine<H> {
    config: EngineConfig,
    peers: Mutex<Vec<Arc<PeerSlot<H>>>>,
    next_id: AtomicUsize,
    rr_cursor: AtomicUsize,
    cancelled: AtomicBool,
    last_poll: Mutex<Instant>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<H: Clone> Engine<H> {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate_strict()?;
        Ok(Self {
            config,
            peers: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            rr_cursor: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            last_poll: Mutex::new(Instant::now()),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(EngineConfig::default())
    }

    /// Register a new peer: bind a local socket, remember the host's opaque
    /// handle, and send the opening hello
    pub async fn connect(
        &self,
        address: SocketAddr,
        credentials: &Credentials,
        handle: H,
    ) -> Result<PeerId> {
        let bind_addr = if address.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(address).await?;

        let id = PeerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let peer = Peer::new(address, credentials, self.config.clone(), Instant::now());
        let slot = Arc::new(PeerSlot {
            id,
            handle,
            socket,
            peer: Mutex::new(peer),
            disconnect_requested: AtomicBool::new(false),
        });
        flush_outgoing(&slot);
        lock(&self.peers).push(slot);
        debug!(peer = id.0, %address, "peer registered");
        Ok(id)
    }

    /// Encode and submit an outbound packet on one of the peer's channels
    pub fn send(
        &self,
        peer: PeerId,
        channel: u8,
        reliable: bool,
        command: u16,
        fields: &[FieldValue],
    ) -> Result<()> {
        let slot = self.slot(peer)?;
        lock(&slot.peer).send(channel, reliable, command, fields, Instant::now())?;
        flush_outgoing(&slot);
        Ok(())
    }

    /// Request a teardown. Safe to call from outside a poll cycle: the
    /// request is queued and applied at the next safe point in `poll`, so
    /// in-progress reliability state is never corrupted.
    pub fn disconnect(&self, peer: PeerId) -> Result<()> {
        let slot = self.slot(peer)?;
        slot.disconnect_requested.store(true, Ordering::Release);
        Ok(())
    }

    /// Request cooperative shutdown; observed at the start of the next poll
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Time elapsed since the previous poll started
    pub fn dtime(&self) -> Duration {
        lock(&self.last_poll).elapsed()
    }

    pub fn peer_state(&self, peer: PeerId) -> Result<PeerState> {
        Ok(lock(&self.slot(peer)?.peer).state())
    }

    /// Negotiated `(serialize_ver, protocol_ver)` for a peer; `(0, 0)`
    /// until the handshake completes
    pub fn peer_versions(&self, peer: PeerId) -> Result<(u8, u16)> {
        Ok(lock(&self.slot(peer)?.peer).versions())
    }

    /// Ids of all peers still registered for polling
    pub fn connected_peers(&self) -> Vec<PeerId> {
        lock(&self.peers).iter().map(|slot| slot.id).collect()
    }

    /// Service all peers and return the first available event, or
    /// `TimedOut` once `timeout` has elapsed with nothing to deliver.
    ///
    /// # Errors
    /// `Cancelled` when the cancellation flag is set and no teardown event
    /// remains to deliver; on the first observation every live peer is
    /// moved toward `Disconnecting`, and subsequent calls drain one
    /// `Disconnected` event each until the peer set is empty.
    pub async fn poll(&self, timeout: Duration) -> Result<PollOutcome<H>> {
        let started = Instant::now();
        *lock(&self.last_poll) = started;

        if self.is_cancelled() {
            self.cancel_all_peers();
            return match self.pick_event() {
                Some(outcome) => Ok(outcome),
                None => Err(ProtocolError::Cancelled),
            };
        }

        let deadline = started + timeout;
        loop {
            self.service_all_peers();
            if let Some(outcome) = self.pick_event() {
                return Ok(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(PollOutcome::TimedOut);
            }
            self.wait_for_traffic((deadline - now).min(WAIT_SLICE)).await;
        }
    }

    /// Push every live peer toward Disconnecting with a best-effort close
    /// notification
    fn cancel_all_peers(&self) {
        let now = Instant::now();
        for slot in lock(&self.peers).iter() {
            let mut peer = lock(&slot.peer);
            if peer.state() < PeerState::Disconnecting {
                peer.begin_disconnect(DisconnectReason::Cancelled, now);
                flush_locked(slot, &mut peer);
            }
        }
    }

    /// One pass over every peer: apply queued disconnects at this safe
    /// point, run logical timers, drain sockets, flush output
    fn service_all_peers(&self) {
        let now = Instant::now();
        let slots: Vec<_> = lock(&self.peers).clone();

        for slot in &slots {
            let mut peer = lock(&slot.peer);
            if slot.disconnect_requested.swap(false, Ordering::AcqRel) {
                peer.begin_disconnect(DisconnectReason::Requested, now);
            }
            peer.tick(now);
            drain_socket(slot, &mut peer, now);
            flush_locked(slot, &mut peer);
        }
    }

    /// Round-robin pick of at most one queued event; the starting point
    /// rotates between calls so no peer starves the others
    fn pick_event(&self) -> Option<PollOutcome<H>> {
        let slots: Vec<_> = lock(&self.peers).clone();
        let count = slots.len();
        if count == 0 {
            return None;
        }
        let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % count;
        for offset in 0..count {
            let slot = &slots[(start + offset) % count];
            let mut peer = lock(&slot.peer);
            let Some(event) = peer.pop_event() else {
                continue;
            };
            if matches!(event, PeerEvent::Disconnected(_)) {
                // Terminal: flush the close notification, then drop the
                // peer from future polling
                flush_locked(slot, &mut peer);
                peer.finalize_close();
                drop(peer);
                self.remove(slot.id);
            }
            return Some(PollOutcome::Event {
                peer: slot.id,
                handle: slot.handle.clone(),
                event,
            });
        }
        None
    }

    async fn wait_for_traffic(&self, slice: Duration) {
        let slots: Vec<_> = lock(&self.peers).clone();
        if slots.is_empty() {
            tokio::time::sleep(slice).await;
            return;
        }
        let readiness = slots
            .iter()
            .map(|slot| Box::pin(slot.socket.readable()))
            .collect::<Vec<_>>();
        let _ = tokio::time::timeout(slice, futures::future::select_all(readiness)).await;
    }

    fn slot(&self, peer: PeerId) -> Result<Arc<PeerSlot<H>>> {
        lock(&self.peers)
            .iter()
            .find(|slot| slot.id == peer)
            .cloned()
            .ok_or(ProtocolError::UnknownPeer)
    }

    fn remove(&self, peer: PeerId) {
        lock(&self.peers).retain(|slot| slot.id != peer);
        trace!(peer = peer.0, "peer removed from polling");
    }
}

fn drain_socket<H>(slot: &PeerSlot<H>, peer: &mut Peer, now: Instant) {
    let mut buf = [0u8; 65_536];
    loop {
        match slot.socket.try_recv(&mut buf) {
            Ok(len) => peer.handle_datagram(Bytes::copy_from_slice(&buf[..len]), now),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => {
                // Transient network errors (e.g. ICMP unreachable surfacing
                // as ConnectionRefused) are loss, not connection failure
                debug!(error = %err, "socket receive error ignored");
                break;
            }
        }
    }
}

fn flush_outgoing<H>(slot: &Arc<PeerSlot<H>>) {
    let mut peer = lock(&slot.peer);
    flush_locked(slot, &mut peer);
}

fn flush_locked<H>(slot: &PeerSlot<H>, peer: &mut Peer) {
    while let Some(datagram) = peer.pop_datagram() {
        if let Err(err) = slot.socket.try_send(&datagram) {
            // Dropped datagrams are indistinguishable from network loss;
            // the reliability layer retransmits what matters
            trace!(error = %err, "datagram send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            player_name: "alice".into(),
            password: "hunter2".into(),
        }
    }

    #[tokio::test]
    async fn empty_engine_times_out_after_requested_timeout() {
        let engine: Engine<()> = Engine::with_defaults().unwrap();
        let requested = Duration::from_millis(60);
        let started = Instant::now();
        let outcome = engine.poll(requested).await.unwrap();
        assert!(matches!(outcome, PollOutcome::TimedOut));
        assert!(started.elapsed() >= requested);
    }

    #[tokio::test]
    async fn cancel_is_observed_before_waiting() {
        let engine: Engine<()> = Engine::with_defaults().unwrap();
        engine.cancel();
        let started = Instant::now();
        let err = engine.poll(Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cancel_drains_disconnect_events_then_reports_cancelled() {
        let engine: Engine<&'static str> = Engine::with_defaults().unwrap();
        let id = engine
            .connect("127.0.0.1:1".parse().unwrap(), &creds(), "a")
            .await
            .unwrap();
        engine.cancel();

        // The cancelled peer's Disconnected event is delivered first
        let outcome = engine.poll(Duration::from_millis(200)).await.unwrap();
        match outcome {
            PollOutcome::Event { peer, handle, event } => {
                assert_eq!(peer, id);
                assert_eq!(handle, "a");
                assert_eq!(
                    event,
                    PeerEvent::Disconnected(DisconnectReason::Cancelled)
                );
            }
            PollOutcome::TimedOut => panic!("expected the disconnect event"),
        }
        assert!(engine.connected_peers().is_empty());

        // With nothing left to drain, poll reports the cancellation
        let err = engine.poll(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Cancelled));
    }

    #[tokio::test]
    async fn disconnect_request_yields_exactly_one_event() {
        let engine: Engine<u32> = Engine::with_defaults().unwrap();
        let id = engine
            .connect("127.0.0.1:1".parse().unwrap(), &creds(), 5)
            .await
            .unwrap();

        engine.disconnect(id).unwrap();
        let outcome = engine.poll(Duration::from_millis(500)).await.unwrap();
        assert!(matches!(
            outcome,
            PollOutcome::Event {
                event: PeerEvent::Disconnected(DisconnectReason::Requested),
                ..
            }
        ));

        // Peer is gone: no further events, operations fail cleanly
        let outcome = engine.poll(Duration::from_millis(50)).await.unwrap();
        assert!(matches!(outcome, PollOutcome::TimedOut));
        assert!(matches!(
            engine.disconnect(id).unwrap_err(),
            ProtocolError::UnknownPeer
        ));
    }

    #[tokio::test]
    async fn send_before_active_is_invalid_state() {
        let engine: Engine<()> = Engine::with_defaults().unwrap();
        let id = engine
            .connect("127.0.0.1:1".parse().unwrap(), &creds(), ())
            .await
            .unwrap();
        let err = engine
            .send(id, 0, true, crate::codec::schema::CMD_CHAT_MESSAGE, &[])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidState(_)));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = EngineConfig::default_with_overrides(|c| c.retry_ceiling = 0);
        assert!(Engine::<()>::new(config).is_err());
    }
}
