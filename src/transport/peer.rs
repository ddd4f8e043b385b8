//! Peer connection state machine.
//!
//! One [`Peer`] is one client-to-server connection:
//! `Connecting -> Handshaking -> Authenticating -> Active -> Disconnecting
//! -> Closed` (terminal). Closed peers are never reused.
//!
//! A peer is pure state: it consumes received datagrams and the passage of
//! time, and produces outbound datagrams and host events into queues that
//! the scheduler drains. All I/O lives in the scheduler, which keeps the
//! peer trivially testable and lock-friendly.

use super::channel::Channel;
use super::wire::{ControlMsg, PacketBody, WirePacket, NUM_CHANNELS};
use crate::codec::schema::{
    CMD_ACCESS_DENIED, CMD_AUTH_CHALLENGE, CMD_AUTH_INIT, CMD_AUTH_PROOF, CMD_AUTH_RESULT,
};
use crate::codec::value::{FieldValue, LogicalPacket};
use crate::config::{
    EngineConfig, PROTOCOL_VER_MAX, PROTOCOL_VER_MIN, SERIALIZE_VER_MAX, SERIALIZE_VER_MIN,
};
use crate::error::{ProtocolError, Result};
use crate::protocol::auth::AuthSession;
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Consecutive undecodable packets tolerated before the connection is
/// considered broken
const MALFORMED_THRESHOLD: u32 = 32;

/// Connection lifecycle. Ordering is meaningful: states only ever advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Authenticating,
    Active,
    Disconnecting,
    Closed,
}

/// Why a peer reached `Disconnecting`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Host asked for the teardown
    Requested,
    /// Server sent a disconnect notification
    ServerClosed,
    /// Retry ceiling exceeded on a reliable send
    PeerUnresponsive,
    /// Login handshake rejected
    AuthenticationFailed,
    /// Idle timeout elapsed with no traffic
    Timeout,
    /// Repeated malformed traffic or a handshake violation
    ProtocolViolation,
    /// Engine-wide cancellation
    Cancelled,
}

/// Application-level event surfaced to the host
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Handshake and authentication completed; gameplay traffic may flow
    Connected,
    Packet(LogicalPacket),
    Disconnected(DisconnectReason),
}

/// Login identity for the verifier handshake
#[derive(Debug, Clone)]
pub struct Credentials {
    pub player_name: String,
    pub password: String,
}

pub struct Peer {
    address: SocketAddr,
    /// Assigned by the server during handshake; 0 is unassigned
    peer_id: u16,
    serialize_ver: u8,
    protocol_ver: u16,
    state: PeerState,
    channels: [Channel; NUM_CHANNELS as usize],
    auth: AuthSession,
    last_activity: Instant,
    last_send: Instant,
    last_hello: Instant,
    malformed_streak: u32,
    out_queue: VecDeque<Bytes>,
    events: VecDeque<PeerEvent>,
    config: EngineConfig,
}

impl Peer {
    /// Create a connecting peer and queue the opening hello
    pub fn new(address: SocketAddr, credentials: &Credentials, config: EngineConfig, now: Instant) -> Self {
        let mut peer = Self {
            address,
            peer_id: 0,
            serialize_ver: 0,
            protocol_ver: 0,
            state: PeerState::Connecting,
            channels: [Channel::new(0), Channel::new(1), Channel::new(2)],
            auth: AuthSession::new(&credentials.player_name, &credentials.password),
            last_activity: now,
            last_send: now,
            last_hello: now,
            malformed_streak: 0,
            out_queue: VecDeque::new(),
            events: VecDeque::new(),
            config,
        };
        peer.queue_hello(now);
        peer
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn peer_id(&self) -> u16 {
        self.peer_id
    }

    /// Negotiated `(serialize_ver, protocol_ver)`; fixed once handshaken
    pub fn versions(&self) -> (u8, u16) {
        (self.serialize_ver, self.protocol_ver)
    }

    /// Session key derived by the login handshake, once Active
    pub fn session_key(&self) -> Option<&[u8]> {
        self.auth.shared_key()
    }

    pub fn pop_event(&mut self) -> Option<PeerEvent> {
        self.events.pop_front()
    }

    pub fn has_event(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn pop_datagram(&mut self) -> Option<Bytes> {
        self.out_queue.pop_front()
    }

    /// Encode a command and hand it to the reliability layer.
    ///
    /// Host sends require an `Active` connection; the negotiated versions
    /// do not exist before then.
    pub fn send(
        &mut self,
        channel: u8,
        reliable: bool,
        command: u16,
        fields: &[FieldValue],
        now: Instant,
    ) -> Result<()> {
        if self.state != PeerState::Active {
            return Err(ProtocolError::InvalidState("peer is not active"));
        }
        self.submit(channel, reliable, command, fields, now)
    }

    /// Internal send path, also used for auth traffic before `Active`
    fn submit(
        &mut self,
        channel: u8,
        reliable: bool,
        command: u16,
        fields: &[FieldValue],
        now: Instant,
    ) -> Result<()> {
        if channel >= NUM_CHANNELS {
            return Err(ProtocolError::InvalidState("channel out of range"));
        }
        let body = crate::codec::encode(command, fields, self.serialize_ver, self.protocol_ver)?;
        let packets = self.channels[channel as usize].send(
            self.peer_id,
            reliable,
            body,
            self.config.datagram_limit,
            now,
        )?;
        for packet in packets {
            self.queue_datagram(packet, now);
        }
        Ok(())
    }

    /// Feed one received datagram through framing, reliability, and codec
    pub fn handle_datagram(&mut self, bytes: Bytes, now: Instant) {
        if self.state >= PeerState::Disconnecting {
            return;
        }
        self.last_activity = now;

        let packet = match WirePacket::decode(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                self.note_malformed(&err);
                return;
            }
        };

        match packet.body {
            PacketBody::Ack => {
                self.channels[packet.channel as usize].acknowledge(packet.seq);
            }
            PacketBody::Control(ref msg) => self.handle_control(msg.clone(), now),
            PacketBody::Data(_) => {
                let channel = packet.channel;
                let (ack, payloads) = self.channels[channel as usize].receive(packet, now);
                if let Some(seq) = ack {
                    self.queue_datagram(WirePacket::ack(self.peer_id, channel, seq), now);
                }
                for payload in payloads {
                    self.route_payload(payload, now);
                }
            }
        }
    }

    fn handle_control(&mut self, msg: ControlMsg, now: Instant) {
        match msg {
            ControlMsg::HelloAck {
                peer_id,
                serialize_ver,
                protocol_ver,
            } => {
                if self.state != PeerState::Connecting {
                    trace!(peer = self.peer_id, "duplicate hello-ack ignored");
                    return;
                }
                if peer_id == 0 {
                    warn!("server assigned peer id 0");
                    self.begin_disconnect(DisconnectReason::ProtocolViolation, now);
                    return;
                }
                if !(SERIALIZE_VER_MIN..=SERIALIZE_VER_MAX).contains(&serialize_ver)
                    || !(PROTOCOL_VER_MIN..=PROTOCOL_VER_MAX).contains(&protocol_ver)
                {
                    warn!(
                        serialize_ver,
                        protocol_ver, "server negotiated versions outside supported range"
                    );
                    self.begin_disconnect(DisconnectReason::ProtocolViolation, now);
                    return;
                }
                self.peer_id = peer_id;
                self.serialize_ver = serialize_ver;
                self.protocol_ver = protocol_ver;
                self.state = PeerState::Handshaking;
                info!(
                    peer = peer_id,
                    serialize_ver, protocol_ver, "handshake complete, authenticating"
                );
                self.start_auth(now);
            }
            ControlMsg::Ping => {}
            ControlMsg::Disconnect => {
                debug!(peer = self.peer_id, "server requested disconnect");
                self.begin_disconnect(DisconnectReason::ServerClosed, now);
            }
            ControlMsg::Hello { .. } => {
                // Client role: an inbound hello is a confused remote
                self.note_malformed(&ProtocolError::InvalidState("hello from server"));
            }
        }
    }

    fn start_auth(&mut self, now: Instant) {
        let name = self.auth.name().to_string();
        let started = self.auth.hello_sent().and_then(|()| {
            self.submit(
                0,
                true,
                CMD_AUTH_INIT,
                &[FieldValue::Str(name)],
                now,
            )
        });
        match started {
            Ok(()) => self.state = PeerState::Authenticating,
            Err(err) => {
                warn!(error = %err, "failed to start authentication");
                self.begin_disconnect(DisconnectReason::AuthenticationFailed, now);
            }
        }
    }

    /// Decode one reassembled payload and act on it
    fn route_payload(&mut self, payload: Bytes, now: Instant) {
        let packet = match crate::codec::decode(payload, self.serialize_ver, self.protocol_ver) {
            Ok(packet) => packet,
            Err(ProtocolError::UnsupportedCommand(id)) => {
                // A newer server may speak commands this build lacks
                debug!(command = id, "dropping packet with unknown command");
                return;
            }
            Err(err) => {
                self.note_malformed(&err);
                return;
            }
        };
        self.malformed_streak = 0;

        match packet.command {
            CMD_AUTH_CHALLENGE => self.on_auth_challenge(packet, now),
            CMD_AUTH_RESULT => self.on_auth_result(packet, now),
            CMD_ACCESS_DENIED => {
                self.events.push_back(PeerEvent::Packet(packet));
                self.begin_disconnect(DisconnectReason::ServerClosed, now);
            }
            _ => self.events.push_back(PeerEvent::Packet(packet)),
        }
    }

    fn on_auth_challenge(&mut self, packet: LogicalPacket, now: Instant) {
        let [FieldValue::Blob(salt), FieldValue::Blob(server_key)] = packet.fields.as_slice()
        else {
            self.note_malformed(&ProtocolError::MalformedPacket(
                "auth challenge field shape".into(),
            ));
            return;
        };
        let proof = self
            .auth
            .handle_challenge(salt, server_key)
            .and_then(|(client_key, proof)| {
                self.submit(
                    0,
                    true,
                    CMD_AUTH_PROOF,
                    &[FieldValue::Blob(client_key), FieldValue::Blob(proof)],
                    now,
                )
            });
        if let Err(err) = proof {
            warn!(error = %err, "authentication challenge failed");
            self.begin_disconnect(DisconnectReason::AuthenticationFailed, now);
        }
    }

    fn on_auth_result(&mut self, packet: LogicalPacket, now: Instant) {
        let [FieldValue::Blob(proof)] = packet.fields.as_slice() else {
            self.note_malformed(&ProtocolError::MalformedPacket(
                "auth result field shape".into(),
            ));
            return;
        };
        match self.auth.handle_result(proof) {
            Ok(()) => {
                info!(peer = self.peer_id, "authenticated, connection active");
                self.state = PeerState::Active;
                self.events.push_back(PeerEvent::Connected);
            }
            Err(err) => {
                warn!(error = %err, "server proof rejected");
                self.begin_disconnect(DisconnectReason::AuthenticationFailed, now);
            }
        }
    }

    /// Run the logical timers: hello resends, retransmissions, reorder and
    /// split maintenance, keepalive, idle timeout
    pub fn tick(&mut self, now: Instant) {
        if self.state >= PeerState::Disconnecting {
            return;
        }

        if now.duration_since(self.last_activity) >= self.config.idle_timeout {
            debug!(peer = self.peer_id, "idle timeout");
            self.begin_disconnect(DisconnectReason::Timeout, now);
            return;
        }

        if self.state == PeerState::Connecting
            && now.duration_since(self.last_hello) >= self.config.hello_interval
        {
            self.queue_hello(now);
        }

        for index in 0..self.channels.len() {
            match self.channels[index].due_retransmits(
                now,
                self.config.retransmit_interval,
                self.config.retry_ceiling,
            ) {
                Ok(due) => {
                    for packet in due {
                        self.queue_datagram(packet, now);
                    }
                }
                Err(_) => {
                    self.begin_disconnect(DisconnectReason::PeerUnresponsive, now);
                    return;
                }
            }

            let released = self.channels[index].maintain(
                now,
                self.config.reorder_timeout,
                self.config.split_ttl,
            );
            for payload in released {
                self.route_payload(payload, now);
            }
        }

        if self.state == PeerState::Active
            && now.duration_since(self.last_send) >= self.config.hello_interval
        {
            self.queue_datagram(WirePacket::control(self.peer_id, ControlMsg::Ping), now);
        }
    }

    /// Move toward teardown: best-effort close notification, one
    /// `Disconnected` event, buffers released when the scheduler drops the
    /// peer after surfacing the event
    pub fn begin_disconnect(&mut self, reason: DisconnectReason, now: Instant) {
        if self.state >= PeerState::Disconnecting {
            return;
        }
        info!(peer = self.peer_id, ?reason, "disconnecting");
        self.queue_datagram(WirePacket::control(self.peer_id, ControlMsg::Disconnect), now);
        self.state = PeerState::Disconnecting;
        self.events.push_back(PeerEvent::Disconnected(reason));
    }

    /// Terminal transition, called by the scheduler once the `Disconnected`
    /// event has been surfaced and the close notification flushed
    pub fn finalize_close(&mut self) {
        self.state = PeerState::Closed;
    }

    fn queue_hello(&mut self, now: Instant) {
        self.last_hello = now;
        self.queue_datagram(
            WirePacket::control(
                0,
                ControlMsg::Hello {
                    serialize_min: SERIALIZE_VER_MIN,
                    serialize_max: SERIALIZE_VER_MAX,
                    protocol_min: PROTOCOL_VER_MIN,
                    protocol_max: PROTOCOL_VER_MAX,
                },
            ),
            now,
        );
    }

    fn queue_datagram(&mut self, packet: WirePacket, now: Instant) {
        self.last_send = now;
        self.out_queue.push_back(packet.encode());
    }

    fn note_malformed(&mut self, err: &ProtocolError) {
        self.malformed_streak += 1;
        debug!(error = %err, streak = self.malformed_streak, "dropping malformed packet");
        if self.malformed_streak >= MALFORMED_THRESHOLD {
            warn!(peer = self.peer_id, "malformed packet threshold exceeded");
            // Threshold reached outside a poll timer; reuse last_activity as
            // the closest timestamp available
            self.begin_disconnect(DisconnectReason::ProtocolViolation, self.last_activity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::schema::CMD_CHAT_MESSAGE;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:30000".parse().unwrap()
    }

    fn creds() -> Credentials {
        Credentials {
            player_name: "alice".into(),
            password: "hunter2".into(),
        }
    }

    fn hello_ack(serialize_ver: u8, protocol_ver: u16) -> Bytes {
        WirePacket::control(
            0,
            ControlMsg::HelloAck {
                peer_id: 7,
                serialize_ver,
                protocol_ver,
            },
        )
        .encode()
    }

    #[test]
    fn new_peer_queues_hello_and_resends_on_interval() {
        let now = Instant::now();
        let config = EngineConfig::default();
        let mut peer = Peer::new(addr(), &creds(), config.clone(), now);
        assert_eq!(peer.state(), PeerState::Connecting);
        assert!(peer.pop_datagram().is_some());
        assert!(peer.pop_datagram().is_none());

        peer.tick(now + config.hello_interval);
        let resent = peer.pop_datagram().unwrap();
        let decoded = WirePacket::decode(resent).unwrap();
        assert!(matches!(
            decoded.body,
            PacketBody::Control(ControlMsg::Hello { .. })
        ));
    }

    #[test]
    fn hello_ack_negotiates_versions_and_starts_auth() {
        let now = Instant::now();
        let mut peer = Peer::new(addr(), &creds(), EngineConfig::default(), now);
        peer.pop_datagram();

        peer.handle_datagram(hello_ack(28, 39), now);
        assert_eq!(peer.state(), PeerState::Authenticating);
        assert_eq!(peer.peer_id(), 7);
        assert_eq!(peer.versions(), (28, 39));

        // The queued datagram is the reliable AUTH_INIT
        let auth_init = WirePacket::decode(peer.pop_datagram().unwrap()).unwrap();
        assert!(auth_init.reliable);
        assert!(matches!(auth_init.body, PacketBody::Data(_)));
    }

    #[test]
    fn unsupported_negotiated_version_is_fatal() {
        let now = Instant::now();
        let mut peer = Peer::new(addr(), &creds(), EngineConfig::default(), now);
        peer.pop_datagram();

        peer.handle_datagram(hello_ack(28, 99), now);
        assert_eq!(peer.state(), PeerState::Disconnecting);
        assert_eq!(
            peer.pop_event(),
            Some(PeerEvent::Disconnected(DisconnectReason::ProtocolViolation))
        );
    }

    #[test]
    fn zero_peer_id_is_rejected() {
        let now = Instant::now();
        let mut peer = Peer::new(addr(), &creds(), EngineConfig::default(), now);
        peer.pop_datagram();

        let ack = WirePacket::control(
            0,
            ControlMsg::HelloAck {
                peer_id: 0,
                serialize_ver: 28,
                protocol_ver: 39,
            },
        )
        .encode();
        peer.handle_datagram(ack, now);
        assert_eq!(peer.state(), PeerState::Disconnecting);
    }

    #[test]
    fn send_requires_active_state() {
        let now = Instant::now();
        let mut peer = Peer::new(addr(), &creds(), EngineConfig::default(), now);
        let err = peer
            .send(0, true, CMD_CHAT_MESSAGE, &[], now)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidState(_)));
    }

    #[test]
    fn server_disconnect_surfaces_one_event() {
        let now = Instant::now();
        let mut peer = Peer::new(addr(), &creds(), EngineConfig::default(), now);
        peer.pop_datagram();

        peer.handle_datagram(WirePacket::control(0, ControlMsg::Disconnect).encode(), now);
        assert_eq!(
            peer.pop_event(),
            Some(PeerEvent::Disconnected(DisconnectReason::ServerClosed))
        );
        assert_eq!(peer.pop_event(), None);

        // Further traffic after Disconnecting is ignored
        peer.handle_datagram(WirePacket::control(0, ControlMsg::Disconnect).encode(), now);
        assert_eq!(peer.pop_event(), None);
    }

    #[test]
    fn idle_timeout_disconnects() {
        let now = Instant::now();
        let config = EngineConfig::default();
        let idle = config.idle_timeout;
        let mut peer = Peer::new(addr(), &creds(), config, now);
        peer.tick(now + idle);
        assert_eq!(
            peer.pop_event(),
            Some(PeerEvent::Disconnected(DisconnectReason::Timeout))
        );
    }

    #[test]
    fn malformed_flood_eventually_disconnects() {
        let now = Instant::now();
        let mut peer = Peer::new(addr(), &creds(), EngineConfig::default(), now);
        for _ in 0..MALFORMED_THRESHOLD {
            peer.handle_datagram(Bytes::from_static(&[0xFF]), now);
        }
        assert_eq!(peer.state(), PeerState::Disconnecting);
    }

    #[test]
    fn retry_ceiling_breach_reports_peer_unresponsive() {
        let start = Instant::now();
        let config = EngineConfig::default_with_overrides(|c| {
            c.retry_ceiling = 2;
            c.retransmit_interval = Duration::from_millis(100);
            c.idle_timeout = Duration::from_secs(3600);
        });
        let mut peer = Peer::new(addr(), &creds(), config.clone(), start);
        peer.pop_datagram();
        peer.handle_datagram(hello_ack(28, 39), start);

        // AUTH_INIT sits unacknowledged; drive time forward until the
        // ceiling trips
        let mut t = start;
        for _ in 0..=config.retry_ceiling + 1 {
            t += config.retransmit_interval;
            peer.tick(t);
        }
        assert_eq!(
            peer.pop_event(),
            Some(PeerEvent::Disconnected(DisconnectReason::PeerUnresponsive))
        );
    }
}
