//! SCTP association carried over DTLS.
//!
//! [RFC4960]: https://datatracker.ietf.org/doc/html/rfc4960
//! [RFC8261]: https://datatracker.ietf.org/doc/html/rfc8261
//!
//! The association is a sans-IO state machine: packets received from the
//! DTLS layer are fed into [`Association::handle_input`], packets to send
//! are drained with [`Association::poll_transmit`] and handed back to the
//! DTLS layer, and timers are driven with [`Association::handle_timeout`].
//!
//! Only what a WebRTC data channel needs is implemented: a single path,
//! no partial reliability, no stream reconfiguration.

pub mod datachannel;

use self::datachannel::{
    DataChannelOpen, DcepMessage, PPID_BINARY_EMPTY, PPID_DCEP, PPID_STRING_EMPTY,
};

use crate::Error;

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt};
use aws_lc_rs::constant_time::verify_slices_are_equal;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use codec::{
    crypto::hmac_sha256,
    sctp::{
        COMMON_HEADER_SIZE, Packet,
        cause::ErrorCause,
        chunk::{Chunk, Data, Init, Parameter, Sack, UnrecognizedAction},
    },
};

use rand::Rng;

const DATA_CHUNK_HEADER_SIZE: usize = 16;
const MAX_RTO: Duration = Duration::from_secs(60);

// gap ack blocks carry 16-bit offsets, anything further ahead of the
// cumulative TSN is dropped without acknowledgement.
const MAX_GAP_OFFSET: u32 = u16::MAX as u32;

// IPv4 address, IPv6 address, cookie preservative, host name address and
// supported address types are accepted and ignored.
const IGNORED_PARAMETERS: [u16; 5] = [5, 6, 9, 11, 12];

/// `a < b` in serial number arithmetic.
///
/// # Test
///
/// ```
/// use restream_service::sctp::serial_lt;
///
/// assert!(serial_lt(1, 2));
/// assert!(serial_lt(u32::MAX, 0));
/// assert!(!serial_lt(2, 2));
/// assert!(!serial_lt(0, u32::MAX));
/// ```
pub fn serial_lt(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) < (1 << 31)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    Closed,
    CookieWait,
    CookieEchoed,
    Established,
    ShutdownPending,
    ShutdownSent,
    ShutdownReceived,
    ShutdownAckSent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SctpEvent {
    Connected,
    Message { stream: u16, ppid: u32, data: Bytes },
    DataChannelOpened { stream: u16, label: String },
    Closed { reason: String },
}

#[derive(Debug, Clone)]
pub struct SctpOptions {
    /// SCTP port on both sides, negotiated out of band with `a=sctp-port`.
    pub port: u16,
    /// largest SCTP packet handed to the DTLS layer.
    pub mtu: usize,
    /// largest user message accepted in either direction.
    pub max_message_size: usize,
    /// advertised receiver window credit.
    pub a_rwnd: u32,
    /// number of inbound and outbound streams offered.
    pub streams: u16,
    /// RTO.Initial
    pub rto: Duration,
    /// Max.Init.Retransmits
    pub max_init_retransmits: u32,
    /// Association.Max.Retrans
    pub max_retransmits: u32,
    /// Valid.Cookie.Life
    pub cookie_lifetime: Duration,
}

impl Default for SctpOptions {
    fn default() -> Self {
        Self {
            port: 5000,
            mtu: 1200,
            max_message_size: 256 * 1024,
            a_rwnd: 1024 * 1024,
            streams: 1024,
            rto: Duration::from_secs(1),
            max_init_retransmits: 8,
            max_retransmits: 10,
            cookie_lifetime: Duration::from_secs(60),
        }
    }
}

/// State Cookie
///
/// Everything the passive side needs to build the association from a
/// COOKIE ECHO, signed with a secret that never leaves the association.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Cookie {
    peer_tag: u32,
    local_tag: u32,
    peer_tsn: u32,
    local_tsn: u32,
    peer_rwnd: u32,
    peer_outbound: u16,
    peer_inbound: u16,
    timestamp: u64,
}

impl Cookie {
    const SIZE: usize = 32;

    fn seal(&self, secret: &[u8]) -> Bytes {
        let mut bytes = BytesMut::with_capacity(Self::SIZE + 32);
        bytes.put_u32(self.peer_tag);
        bytes.put_u32(self.local_tag);
        bytes.put_u32(self.peer_tsn);
        bytes.put_u32(self.local_tsn);
        bytes.put_u32(self.peer_rwnd);
        bytes.put_u16(self.peer_outbound);
        bytes.put_u16(self.peer_inbound);
        bytes.put_u64(self.timestamp);

        let mac = hmac_sha256(secret, &[&bytes[..]]);
        bytes.put(&mac[..]);
        bytes.freeze()
    }

    fn open(bytes: &[u8], secret: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE + 32 {
            return None;
        }

        let mac = hmac_sha256(secret, &[&bytes[..Self::SIZE]]);
        verify_slices_are_equal(&mac, &bytes[Self::SIZE..]).ok()?;

        let mut reader = &bytes[..Self::SIZE];
        Some(Self {
            peer_tag: reader.get_u32(),
            local_tag: reader.get_u32(),
            peer_tsn: reader.get_u32(),
            local_tsn: reader.get_u32(),
            peer_rwnd: reader.get_u32(),
            peer_outbound: reader.get_u16(),
            peer_inbound: reader.get_u16(),
            timestamp: reader.get_u64(),
        })
    }
}

/// A control packet waiting for its acknowledgement, T1 and T2.
#[derive(Debug)]
struct Retransmission {
    packet: Bytes,
    deadline: Instant,
    interval: Duration,
    count: u32,
}

impl Retransmission {
    fn new(packet: Bytes, rto: Duration, now: Instant) -> Self {
        Self {
            deadline: now + rto,
            interval: rto,
            count: 0,
            packet,
        }
    }
}

/// Fire an expired retransmission timer, `false` once the limit is
/// exhausted.
fn retransmit(
    timer: &mut Option<Retransmission>,
    transmits: &mut VecDeque<Bytes>,
    limit: u32,
    now: Instant,
) -> bool {
    let Some(timer) = timer else {
        return true;
    };

    if now < timer.deadline {
        return true;
    }

    if timer.count >= limit {
        return false;
    }

    timer.count += 1;
    timer.interval = (timer.interval * 2).min(MAX_RTO);
    timer.deadline = now + timer.interval;
    transmits.push_back(timer.packet.clone());
    true
}

/// Unrecognized parameters of an INIT or INIT ACK that must be reported
/// to the sender.
///
/// The upper two bits of the parameter type select the action in the
/// same way they do for chunk types.
fn unrecognized_parameters(parameters: &[Parameter]) -> Vec<Parameter> {
    let mut reports = Vec::new();
    for parameter in parameters {
        match parameter.kind {
            Parameter::STATE_COOKIE
            | Parameter::SUPPORTED_EXTENSIONS
            | Parameter::FORWARD_TSN_SUPPORTED => continue,
            kind if IGNORED_PARAMETERS.contains(&kind) => continue,
            _ => (),
        }

        let action = UnrecognizedAction::from_type((parameter.kind >> 8) as u8);
        if action.should_report() {
            reports.push(parameter.clone());
        }

        if !action.should_skip() {
            break;
        }
    }

    reports
}

/// An SCTP association with a single remote endpoint.
pub struct Association {
    options: SctpOptions,
    state: AssociationState,
    close_reason: Option<String>,
    epoch: Instant,
    secret: [u8; 32],
    local_tag: u32,
    peer_tag: u32,
    remote_port: u16,
    inbound_streams: u16,
    outbound_streams: u16,
    // sending side
    initial_tsn: u32,
    next_tsn: u32,
    ssn: HashMap<u16, u16>,
    queue: VecDeque<Data>,
    inflight: VecDeque<Data>,
    peer_rwnd: u32,
    rto: Duration,
    t3: Option<Instant>,
    error_count: u32,
    // receiving side
    cumulative_tsn: u32,
    received: HashMap<u32, Option<Data>>,
    duplicates: Vec<u32>,
    partial: Vec<Data>,
    sack_needed: bool,
    // control
    control: Vec<Chunk>,
    t1: Option<Retransmission>,
    t2: Option<Retransmission>,
    channels: HashMap<u16, String>,
    opening: HashMap<u16, String>,
    transmits: VecDeque<Bytes>,
    events: VecDeque<SctpEvent>,
}

impl Association {
    /// # Test
    ///
    /// ```
    /// use restream_service::sctp::*;
    /// use std::time::Instant;
    ///
    /// let association = Association::new(SctpOptions::default(), Instant::now());
    ///
    /// assert_eq!(association.state(), AssociationState::Closed);
    /// assert!(association.close_reason().is_none());
    /// ```
    pub fn new(options: SctpOptions, now: Instant) -> Self {
        let mut rng = rand::rng();
        let mut secret = [0u8; 32];
        rng.fill(&mut secret);

        let initial_tsn: u32 = rng.random();
        Self {
            local_tag: rng.random_range(1..=u32::MAX),
            remote_port: options.port,
            inbound_streams: options.streams,
            outbound_streams: options.streams,
            peer_rwnd: options.a_rwnd,
            rto: options.rto,
            state: AssociationState::Closed,
            close_reason: None,
            epoch: now,
            peer_tag: 0,
            next_tsn: initial_tsn,
            ssn: HashMap::new(),
            queue: VecDeque::new(),
            inflight: VecDeque::new(),
            t3: None,
            error_count: 0,
            cumulative_tsn: 0,
            received: HashMap::new(),
            duplicates: Vec::new(),
            partial: Vec::new(),
            sack_needed: false,
            control: Vec::new(),
            t1: None,
            t2: None,
            channels: HashMap::new(),
            opening: HashMap::new(),
            transmits: VecDeque::with_capacity(8),
            events: VecDeque::with_capacity(8),
            initial_tsn,
            options,
            secret,
        }
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == AssociationState::Established
    }

    /// why the association was closed, `None` while it is still usable.
    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    /// label of an open data channel.
    pub fn channel(&self, stream: u16) -> Option<&str> {
        self.channels.get(&stream).map(|it| it.as_str())
    }

    /// Start the association as the active side by sending INIT.
    pub fn connect(&mut self, now: Instant) -> Result<(), Error> {
        if self.state != AssociationState::Closed || self.close_reason.is_some() {
            return Err(Error::InvalidState);
        }

        let init = Chunk::Init(Init {
            initiate_tag: self.local_tag,
            a_rwnd: self.options.a_rwnd,
            outbound_streams: self.options.streams,
            inbound_streams: self.options.streams,
            initial_tsn: self.initial_tsn,
            parameters: Vec::new(),
        });

        // INIT is always sent with a zero verification tag.
        let packet = self.packet(0, vec![init]);
        self.transmits.push_back(packet.clone());
        self.t1 = Some(Retransmission::new(packet, self.rto, now));
        self.state = AssociationState::CookieWait;
        Ok(())
    }

    /// Queue a user message.
    ///
    /// The message is split into as many DATA chunks as the MTU requires,
    /// ordered messages take the next stream sequence number of their
    /// stream.
    pub fn send(
        &mut self,
        stream: u16,
        ppid: u32,
        payload: Bytes,
        unordered: bool,
        now: Instant,
    ) -> Result<(), Error> {
        if self.state != AssociationState::Established {
            return Err(Error::InvalidState);
        }

        self.enqueue(stream, ppid, payload, unordered)?;
        self.flush_data(now);
        Ok(())
    }

    /// Open a reliable data channel on `stream`.
    ///
    /// The channel is reported with [`SctpEvent::DataChannelOpened`] once
    /// the peer acknowledges it.
    pub fn open_channel(&mut self, stream: u16, label: &str, now: Instant) -> Result<(), Error> {
        if self.channels.contains_key(&stream) || self.opening.contains_key(&stream) {
            return Err(Error::InvalidState);
        }

        let open = DcepMessage::Open(DataChannelOpen::reliable(label));
        self.send(stream, PPID_DCEP, open.encode(), false, now)?;
        self.opening.insert(stream, label.to_string());
        Ok(())
    }

    /// Start a graceful shutdown, outstanding data is still delivered
    /// before SHUTDOWN is sent.
    pub fn shutdown(&mut self, now: Instant) {
        match self.state {
            AssociationState::Established => {
                self.state = AssociationState::ShutdownPending;
                self.check_shutdown(now);
            }
            AssociationState::CookieWait | AssociationState::CookieEchoed => {
                self.abort("shutdown before establishment");
            }
            _ => (),
        }
    }

    /// Abort the association immediately.
    pub fn abort(&mut self, reason: &str) {
        if self.close_reason.is_some() {
            return;
        }

        if self.state != AssociationState::Closed {
            let cause = ErrorCause::UserInitiatedAbort {
                reason: Bytes::copy_from_slice(reason.as_bytes()),
            };

            let packet = self.packet(
                self.peer_tag,
                vec![Chunk::Abort {
                    reflected: false,
                    causes: vec![cause],
                }],
            );

            self.transmits.push_back(packet);
        }

        self.close(reason);
    }

    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<SctpEvent> {
        self.events.pop_front()
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        [
            self.t1.as_ref().map(|it| it.deadline),
            self.t2.as_ref().map(|it| it.deadline),
            self.t3,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if self.close_reason.is_some() {
            return;
        }

        if !retransmit(
            &mut self.t1,
            &mut self.transmits,
            self.options.max_init_retransmits,
            now,
        ) {
            self.close("init retransmission limit reached");
            return;
        }

        if !retransmit(
            &mut self.t2,
            &mut self.transmits,
            self.options.max_retransmits,
            now,
        ) {
            self.close("shutdown retransmission limit reached");
            return;
        }

        if self.t3.is_some_and(|it| now >= it) {
            self.error_count += 1;
            if self.error_count > self.options.max_retransmits {
                self.close("retransmission limit reached");
                return;
            }

            self.rto = (self.rto * 2).min(MAX_RTO);
            self.t3 = Some(now + self.rto);

            let chunks = self.inflight.iter().cloned().map(Chunk::Data).collect();
            self.send_chunks(chunks);

            log::trace!(
                "sctp retransmit: inflight={}, rto={:?}",
                self.inflight.len(),
                self.rto
            );
        }
    }

    /// Process one SCTP packet received from the DTLS layer.
    ///
    /// Packets with a bad checksum, a truncated header or a verification
    /// tag that does not belong to this association are dropped silently,
    /// a packet that fails to decode in any other way aborts the
    /// association.
    pub fn handle_input(&mut self, bytes: &[u8], now: Instant) {
        if self.close_reason.is_some() {
            return;
        }

        let packet = match Packet::decode(bytes) {
            Ok(it) => it,
            Err(codec::Error::ProtocolViolation(reason)) => {
                if self.state != AssociationState::Closed
                    && Packet::peek_verification_tag(bytes) == Some(self.local_tag)
                {
                    self.abort_with(
                        ErrorCause::ProtocolViolation {
                            information: Bytes::from_static(reason.as_bytes()),
                        },
                        reason,
                    );
                }

                return;
            }
            Err(e) => {
                log::trace!("sctp packet dropped: err={}", e);
                return;
            }
        };

        if !self.accepts(&packet) {
            log::trace!(
                "sctp packet dropped: verification tag={}",
                packet.verification_tag
            );

            return;
        }

        self.remote_port = packet.source_port;
        for chunk in packet.chunks {
            if !self.handle_chunk(chunk, now) {
                break;
            }
        }

        if self.close_reason.is_some() {
            return;
        }

        let mut chunks = std::mem::take(&mut self.control);
        if self.sack_needed {
            self.sack_needed = false;
            chunks.push(Chunk::Sack(self.sack()));
        }

        if !chunks.is_empty() {
            self.send_chunks(chunks);
        }

        self.flush_data(now);
        self.check_shutdown(now);
    }

    fn accepts(&self, packet: &Packet) -> bool {
        let has_init = packet.chunks.iter().any(|it| matches!(it, Chunk::Init(_)));
        if has_init {
            // INIT must be the only chunk of its packet.
            return packet.verification_tag == 0 && packet.chunks.len() == 1;
        }

        let reflected = packet.chunks.iter().any(|it| {
            matches!(
                it,
                Chunk::Abort {
                    reflected: true,
                    ..
                } | Chunk::ShutdownComplete { reflected: true }
            )
        });

        if reflected {
            packet.verification_tag == self.peer_tag
        } else {
            packet.verification_tag == self.local_tag
        }
    }

    /// `false` stops processing the rest of the packet.
    fn handle_chunk(&mut self, chunk: Chunk, now: Instant) -> bool {
        if let Chunk::Unknown { kind, .. } = &chunk {
            let action = UnrecognizedAction::from_type(*kind);
            if action.should_report() {
                self.control.push(Chunk::Error {
                    causes: vec![ErrorCause::UnrecognizedChunkType {
                        chunk: chunk.to_bytes(),
                    }],
                });
            }

            return action.should_skip();
        }

        match chunk {
            Chunk::Init(init) => self.handle_init(init, now),
            Chunk::InitAck(init) => return self.handle_init_ack(init, now),
            Chunk::CookieEcho(cookie) => return self.handle_cookie_echo(&cookie, now),
            Chunk::CookieAck => {
                if self.state == AssociationState::CookieEchoed {
                    self.t1 = None;
                    self.established();
                }
            }
            Chunk::Data(data) => self.handle_data(data),
            Chunk::Sack(sack) => self.handle_sack(&sack, now),
            Chunk::Heartbeat(info) => self.control.push(Chunk::HeartbeatAck(info)),
            Chunk::HeartbeatAck(_) => (),
            Chunk::Abort { causes, .. } => {
                self.close(format!("aborted by peer: {:?}", causes));
                return false;
            }
            Chunk::Shutdown { cumulative_tsn } => self.handle_shutdown(cumulative_tsn, now),
            Chunk::ShutdownAck => {
                if matches!(
                    self.state,
                    AssociationState::ShutdownSent | AssociationState::ShutdownAckSent
                ) {
                    let packet = self.packet(
                        self.peer_tag,
                        vec![Chunk::ShutdownComplete { reflected: false }],
                    );

                    self.transmits.push_back(packet);
                    self.close("shutdown complete");
                    return false;
                }
            }
            Chunk::ShutdownComplete { .. } => {
                if self.state == AssociationState::ShutdownAckSent {
                    self.close("shutdown complete");
                    return false;
                }
            }
            Chunk::Error { causes } => {
                log::warn!("sctp error chunk: causes={:?}", causes);

                let stale = causes
                    .iter()
                    .any(|it| matches!(it, ErrorCause::StaleCookie { .. }));

                if stale && self.state == AssociationState::CookieEchoed {
                    self.close("stale cookie");
                    return false;
                }
            }
            Chunk::Unknown { .. } => (),
        }

        true
    }

    fn handle_init(&mut self, init: Init, now: Instant) {
        match self.state {
            AssociationState::Closed
            | AssociationState::CookieWait
            | AssociationState::CookieEchoed => (),
            _ => {
                log::warn!("sctp init ignored: state={:?}", self.state);
                return;
            }
        }

        if init.initiate_tag == 0 {
            log::warn!("sctp init ignored: zero initiate tag");
            return;
        }

        let cookie = Cookie {
            peer_tag: init.initiate_tag,
            local_tag: self.local_tag,
            peer_tsn: init.initial_tsn,
            local_tsn: self.initial_tsn,
            peer_rwnd: init.a_rwnd,
            peer_outbound: init.outbound_streams,
            peer_inbound: init.inbound_streams,
            timestamp: self.millis(now),
        };

        let mut parameters = vec![Parameter::new(
            Parameter::STATE_COOKIE,
            cookie.seal(&self.secret),
        )];

        for it in unrecognized_parameters(&init.parameters) {
            parameters.push(Parameter::new(Parameter::UNRECOGNIZED_PARAMETER, it.to_bytes()));
        }

        let ack = Chunk::InitAck(Init {
            initiate_tag: self.local_tag,
            a_rwnd: self.options.a_rwnd,
            outbound_streams: self.options.streams,
            inbound_streams: self.options.streams,
            initial_tsn: self.initial_tsn,
            parameters,
        });

        // the passive side keeps no state until the cookie comes back.
        let packet = self.packet(init.initiate_tag, vec![ack]);
        self.transmits.push_back(packet);
    }

    fn handle_init_ack(&mut self, init: Init, now: Instant) -> bool {
        if self.state != AssociationState::CookieWait {
            return true;
        }

        self.peer_tag = init.initiate_tag;

        let Some(cookie) = init.parameter(Parameter::STATE_COOKIE).map(|it| it.value.clone()) else {
            self.abort_with(
                ErrorCause::MissingMandatoryParameter {
                    parameters: vec![Parameter::STATE_COOKIE],
                },
                "init ack without state cookie",
            );

            return false;
        };

        self.set_peer(
            init.initial_tsn,
            init.a_rwnd,
            init.outbound_streams,
            init.inbound_streams,
        );

        let mut chunks = vec![Chunk::CookieEcho(cookie)];
        let unrecognized = unrecognized_parameters(&init.parameters);
        if !unrecognized.is_empty() {
            let mut parameters = BytesMut::new();
            for it in unrecognized {
                parameters.put(it.to_bytes());
            }

            chunks.push(Chunk::Error {
                causes: vec![ErrorCause::UnrecognizedParameters {
                    parameters: parameters.freeze(),
                }],
            });
        }

        let packet = self.packet(self.peer_tag, chunks);
        self.transmits.push_back(packet.clone());
        self.t1 = Some(Retransmission::new(packet, self.rto, now));
        self.state = AssociationState::CookieEchoed;
        true
    }

    fn handle_cookie_echo(&mut self, bytes: &[u8], now: Instant) -> bool {
        let Some(cookie) = Cookie::open(bytes, &self.secret) else {
            log::warn!("sctp cookie echo dropped: invalid cookie");
            return false;
        };

        if cookie.local_tag != self.local_tag {
            return false;
        }

        match self.state {
            AssociationState::Closed
            | AssociationState::CookieWait
            | AssociationState::CookieEchoed => (),
            AssociationState::ShutdownAckSent => {
                let packet = self.packet(
                    cookie.peer_tag,
                    vec![Chunk::Error {
                        causes: vec![ErrorCause::CookieWhileShuttingDown],
                    }],
                );

                self.transmits.push_back(packet);
                return false;
            }
            _ => {
                // duplicated COOKIE ECHO, the COOKIE ACK was lost.
                if cookie.peer_tag == self.peer_tag {
                    self.control.push(Chunk::CookieAck);
                }

                return true;
            }
        }

        let elapsed = self.millis(now).saturating_sub(cookie.timestamp);
        let lifetime = self.options.cookie_lifetime.as_millis() as u64;
        if elapsed > lifetime {
            let staleness = ((elapsed - lifetime) * 1000).min(u32::MAX as u64) as u32;
            let packet = self.packet(
                cookie.peer_tag,
                vec![Chunk::Error {
                    causes: vec![ErrorCause::StaleCookie { staleness }],
                }],
            );

            self.transmits.push_back(packet);
            return false;
        }

        self.peer_tag = cookie.peer_tag;
        self.set_peer(
            cookie.peer_tsn,
            cookie.peer_rwnd,
            cookie.peer_outbound,
            cookie.peer_inbound,
        );

        self.t1 = None;
        self.control.push(Chunk::CookieAck);
        self.established();
        true
    }

    fn handle_data(&mut self, data: Data) {
        if !matches!(
            self.state,
            AssociationState::Established
                | AssociationState::ShutdownPending
                | AssociationState::ShutdownSent
        ) {
            return;
        }

        self.sack_needed = true;

        let tsn = data.tsn;
        if !serial_lt(self.cumulative_tsn, tsn) || self.received.contains_key(&tsn) {
            self.duplicates.push(tsn);
            return;
        }

        if tsn.wrapping_sub(self.cumulative_tsn) > MAX_GAP_OFFSET {
            return;
        }

        // rejected chunks still consume their TSN and are acknowledged.
        let accepted = if data.payload.is_empty() {
            self.control.push(Chunk::Error {
                causes: vec![ErrorCause::NoUserData { tsn }],
            });

            None
        } else if data.stream >= self.inbound_streams {
            self.control.push(Chunk::Error {
                causes: vec![ErrorCause::InvalidStreamIdentifier {
                    stream: data.stream,
                }],
            });

            None
        } else {
            Some(data)
        };

        let unordered = accepted.as_ref().is_some_and(|it| it.unordered);
        self.received.insert(tsn, accepted);

        if unordered {
            self.reassemble_unordered(tsn);
        }

        while let Some(entry) = self.received.remove(&self.cumulative_tsn.wrapping_add(1)) {
            self.cumulative_tsn = self.cumulative_tsn.wrapping_add(1);
            if let Some(data) = entry {
                self.reassemble(data);
            }
        }
    }

    // DATA chunks arrive here in TSN order, the fragments of one message
    // carry consecutive TSNs.
    fn reassemble(&mut self, data: Data) {
        if data.beginning {
            if !self.partial.is_empty() {
                log::warn!("sctp incomplete message dropped: stream={}", data.stream);
                self.partial.clear();
            }
        } else if self.partial.is_empty() {
            return;
        }

        let ending = data.ending;
        self.partial.push(data);

        let size: usize = self.partial.iter().map(|it| it.payload.len()).sum();
        if size > self.options.max_message_size {
            log::warn!("sctp message dropped: size={}", size);
            self.partial.clear();
            return;
        }

        if !ending {
            return;
        }

        let fragments = std::mem::take(&mut self.partial);
        self.deliver(fragments, size);
    }

    // Unordered messages do not wait for the cumulative TSN, a message is
    // delivered as soon as all of its fragments arrived. Delivered
    // fragments stay in `received` as empty entries so their TSNs are
    // still acknowledged in order.
    fn reassemble_unordered(&mut self, tsn: u32) {
        let fragment = |received: &HashMap<u32, Option<Data>>, tsn: u32| {
            received
                .get(&tsn)
                .and_then(|it| it.as_ref())
                .filter(|it| it.unordered)
                .map(|it| (it.beginning, it.ending))
        };

        let mut first = tsn;
        loop {
            match fragment(&self.received, first) {
                Some((true, _)) => break,
                Some((false, _)) => first = first.wrapping_sub(1),
                None => return,
            }
        }

        let mut last = tsn;
        loop {
            match fragment(&self.received, last) {
                Some((_, true)) => break,
                Some((_, false)) => last = last.wrapping_add(1),
                None => return,
            }
        }

        let mut fragments = Vec::with_capacity(last.wrapping_sub(first) as usize + 1);
        let mut next = first;
        loop {
            if let Some(data) = self.received.get_mut(&next).and_then(|it| it.take()) {
                fragments.push(data);
            }

            if next == last {
                break;
            }

            next = next.wrapping_add(1);
        }

        let size: usize = fragments.iter().map(|it| it.payload.len()).sum();
        if size > self.options.max_message_size {
            log::warn!("sctp message dropped: size={}", size);
            return;
        }

        self.deliver(fragments, size);
    }

    fn deliver(&mut self, fragments: Vec<Data>, size: usize) {
        let (stream, ppid) = (fragments[0].stream, fragments[0].ppid);
        let data = if fragments.len() == 1 {
            fragments[0].payload.clone()
        } else {
            let mut bytes = BytesMut::with_capacity(size);
            for it in &fragments {
                bytes.put(&it.payload[..]);
            }

            bytes.freeze()
        };

        match ppid {
            PPID_DCEP => self.handle_dcep(stream, &data),
            PPID_STRING_EMPTY | PPID_BINARY_EMPTY => {
                self.events.push_back(SctpEvent::Message {
                    data: Bytes::new(),
                    stream,
                    ppid,
                })
            }
            _ => self.events.push_back(SctpEvent::Message { stream, ppid, data }),
        }
    }

    fn handle_dcep(&mut self, stream: u16, bytes: &[u8]) {
        match DcepMessage::decode(bytes) {
            Ok(DcepMessage::Open(open)) => {
                if let Err(e) = self.enqueue(stream, PPID_DCEP, DcepMessage::Ack.encode(), false) {
                    log::warn!("sctp data channel ack failed: stream={}, err={}", stream, e);
                    return;
                }

                self.channels.insert(stream, open.label.clone());
                self.events.push_back(SctpEvent::DataChannelOpened {
                    label: open.label,
                    stream,
                });
            }
            Ok(DcepMessage::Ack) => {
                if let Some(label) = self.opening.remove(&stream) {
                    self.channels.insert(stream, label.clone());
                    self.events
                        .push_back(SctpEvent::DataChannelOpened { stream, label });
                }
            }
            Err(e) => {
                log::warn!("sctp dcep message dropped: stream={}, err={}", stream, e);
            }
        }
    }

    fn handle_sack(&mut self, sack: &Sack, now: Instant) {
        if !matches!(
            self.state,
            AssociationState::Established
                | AssociationState::ShutdownPending
                | AssociationState::ShutdownSent
                | AssociationState::ShutdownReceived
        ) {
            return;
        }

        self.acknowledge(sack.cumulative_tsn, &sack.gap_blocks, now);
        self.peer_rwnd = sack.a_rwnd;
    }

    fn handle_shutdown(&mut self, cumulative_tsn: u32, now: Instant) {
        match self.state {
            AssociationState::Established
            | AssociationState::ShutdownPending
            | AssociationState::ShutdownReceived => {
                self.acknowledge(cumulative_tsn, &[], now);
                self.state = AssociationState::ShutdownReceived;
            }
            // both sides started the shutdown at the same time.
            AssociationState::ShutdownSent => {
                let packet = self.packet(self.peer_tag, vec![Chunk::ShutdownAck]);
                self.transmits.push_back(packet.clone());
                self.t2 = Some(Retransmission::new(packet, self.rto, now));
                self.state = AssociationState::ShutdownAckSent;
            }
            _ => (),
        }
    }

    fn acknowledge(&mut self, cumulative_tsn: u32, gap_blocks: &[(u16, u16)], now: Instant) {
        let before = self.inflight.len();
        self.inflight.retain(|it| {
            if !serial_lt(cumulative_tsn, it.tsn) {
                return false;
            }

            let offset = it.tsn.wrapping_sub(cumulative_tsn);
            !gap_blocks
                .iter()
                .any(|(start, end)| offset >= *start as u32 && offset <= *end as u32)
        });

        if self.inflight.len() != before {
            self.error_count = 0;
            self.rto = self.options.rto;
            self.t3 = if self.inflight.is_empty() {
                None
            } else {
                Some(now + self.rto)
            };
        }
    }

    fn enqueue(&mut self, stream: u16, ppid: u32, payload: Bytes, unordered: bool) -> Result<(), Error> {
        if payload.is_empty()
            || payload.len() > self.options.max_message_size
            || stream >= self.outbound_streams
        {
            return Err(Error::Codec(codec::Error::InvalidInput));
        }

        let ssn = if unordered {
            0
        } else {
            let next = self.ssn.entry(stream).or_insert(0);
            let ssn = *next;
            *next = next.wrapping_add(1);
            ssn
        };

        let fragment = self.options.mtu - COMMON_HEADER_SIZE - DATA_CHUNK_HEADER_SIZE;
        let count = payload.len().div_ceil(fragment);
        for index in 0..count {
            let offset = index * fragment;
            let end = (offset + fragment).min(payload.len());
            self.queue.push_back(Data {
                payload: payload.slice(offset..end),
                beginning: index == 0,
                ending: index + 1 == count,
                tsn: self.next_tsn,
                unordered,
                stream,
                ssn,
                ppid,
            });

            self.next_tsn = self.next_tsn.wrapping_add(1);
        }

        Ok(())
    }

    /// Move queued DATA chunks into flight as far as the peer's receive
    /// window allows, at least one chunk is always in flight.
    fn flush_data(&mut self, now: Instant) {
        if !matches!(
            self.state,
            AssociationState::Established
                | AssociationState::ShutdownPending
                | AssociationState::ShutdownReceived
        ) {
            return;
        }

        let mut outstanding: usize = self.inflight.iter().map(|it| it.payload.len()).sum();
        let mut chunks = Vec::new();
        while let Some(next) = self.queue.front() {
            let size = next.payload.len();
            if !self.inflight.is_empty() && outstanding + size > self.peer_rwnd as usize {
                break;
            }

            let Some(data) = self.queue.pop_front() else {
                break;
            };

            outstanding += size;
            chunks.push(Chunk::Data(data.clone()));
            self.inflight.push_back(data);
        }

        if chunks.is_empty() {
            return;
        }

        if self.t3.is_none() {
            self.t3 = Some(now + self.rto);
        }

        self.send_chunks(chunks);
    }

    fn check_shutdown(&mut self, now: Instant) {
        if !(self.queue.is_empty() && self.inflight.is_empty()) {
            return;
        }

        let (chunk, state) = match self.state {
            AssociationState::ShutdownPending => (
                Chunk::Shutdown {
                    cumulative_tsn: self.cumulative_tsn,
                },
                AssociationState::ShutdownSent,
            ),
            AssociationState::ShutdownReceived => {
                (Chunk::ShutdownAck, AssociationState::ShutdownAckSent)
            }
            _ => return,
        };

        let packet = self.packet(self.peer_tag, vec![chunk]);
        self.transmits.push_back(packet.clone());
        self.t2 = Some(Retransmission::new(packet, self.rto, now));
        self.t3 = None;
        self.state = state;
    }

    fn sack(&mut self) -> Sack {
        let mut offsets = self
            .received
            .keys()
            .map(|tsn| tsn.wrapping_sub(self.cumulative_tsn) as u16)
            .collect::<Vec<_>>();

        offsets.sort_unstable();

        let mut gap_blocks: Vec<(u16, u16)> = Vec::new();
        for offset in offsets {
            match gap_blocks.last_mut() {
                Some((_, end)) if *end + 1 == offset => *end = offset,
                _ => gap_blocks.push((offset, offset)),
            }
        }

        let buffered: usize = self
            .received
            .values()
            .flatten()
            .chain(self.partial.iter())
            .map(|it| it.payload.len())
            .sum();

        Sack {
            a_rwnd: self.options.a_rwnd.saturating_sub(buffered as u32),
            duplicates: std::mem::take(&mut self.duplicates),
            cumulative_tsn: self.cumulative_tsn,
            gap_blocks,
        }
    }

    fn set_peer(&mut self, initial_tsn: u32, a_rwnd: u32, outbound: u16, inbound: u16) {
        self.cumulative_tsn = initial_tsn.wrapping_sub(1);
        self.peer_rwnd = a_rwnd;
        self.inbound_streams = self.options.streams.min(outbound);
        self.outbound_streams = self.options.streams.min(inbound);
    }

    fn established(&mut self) {
        self.state = AssociationState::Established;
        self.events.push_back(SctpEvent::Connected);
        log::info!(
            "sctp association established: streams={}/{}",
            self.inbound_streams,
            self.outbound_streams
        );
    }

    fn abort_with(&mut self, cause: ErrorCause, reason: &str) {
        let packet = self.packet(
            self.peer_tag,
            vec![Chunk::Abort {
                reflected: false,
                causes: vec![cause],
            }],
        );

        self.transmits.push_back(packet);
        self.close(reason);
    }

    fn close(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        log::info!("sctp association closed: reason={}", reason);

        self.state = AssociationState::Closed;
        self.queue.clear();
        self.inflight.clear();
        self.received.clear();
        self.partial.clear();
        self.control.clear();
        self.sack_needed = false;
        self.t1 = None;
        self.t2 = None;
        self.t3 = None;
        self.close_reason = Some(reason.clone());
        self.events.push_back(SctpEvent::Closed { reason });
    }

    /// Bundle chunks into as few packets as the MTU allows.
    fn send_chunks(&mut self, chunks: Vec<Chunk>) {
        let mut bundle = Vec::new();
        let mut size = COMMON_HEADER_SIZE;
        for chunk in chunks {
            let len = chunk.wire_len();
            if !bundle.is_empty() && size + len > self.options.mtu {
                let packet = self.packet(self.peer_tag, std::mem::take(&mut bundle));
                self.transmits.push_back(packet);
                size = COMMON_HEADER_SIZE;
            }

            size += len;
            bundle.push(chunk);
        }

        if !bundle.is_empty() {
            let packet = self.packet(self.peer_tag, bundle);
            self.transmits.push_back(packet);
        }
    }

    fn packet(&self, verification_tag: u32, chunks: Vec<Chunk>) -> Bytes {
        Packet {
            source_port: self.options.port,
            destination_port: self.remote_port,
            verification_tag,
            chunks,
        }
        .encode()
    }

    fn millis(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }
}
