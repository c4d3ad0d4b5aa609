pub mod dtls;
pub mod ice;
pub mod packet;
pub mod peer;
pub mod pool;
pub mod sctp;
pub mod srtp;

use self::{
    dtls::{Certificate, DtlsRole},
    ice::candidate::Candidate,
    packet::RtpPacket,
    peer::{ConnectionState, PeerConnection, PeerEvent, PeerOptions, PeerStatistics, SsrcRemap},
    pool::BufferPool,
};

use std::{
    fmt,
    net::SocketAddr,
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use ahash::{HashMap, HashMapExt};
use bytes::Bytes;
use codec::{
    PacketKind,
    rtp::{RtpHeader, rewrite_rtcp_sender_ssrc, rtcp_sender_ssrc},
    stun::{Message, attributes::UserName, methods::MessageClass},
};

use openssl::{error::ErrorStack, ssl::SslContext};
use parking_lot::{Mutex, RwLock};

#[derive(Debug)]
pub enum Error {
    Codec(codec::Error),
    InvalidState,
    InvalidCandidate,
    CertificateRejected,
    HandshakeTimeout,
    HandshakeFailed(String),
    PoolExhausted,
    NotFound,
    Closed,
    Crypto,
    Ssl(ErrorStack),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

impl From<ErrorStack> for Error {
    fn from(value: ErrorStack) -> Self {
        Self::Ssl(value)
    }
}

/// A datagram to send, `source` selects the local socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub contents: Bytes,
}

/// The default HashMap is created without allocating capacity. To improve
/// performance, the tables of the service pre-allocate room for the
/// number of connections a single process is expected to carry.
pub struct Table<K, V>(HashMap<K, V>);

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self(HashMap::with_capacity(1024))
    }
}

impl<K, V> Deref for Table<K, V> {
    type Target = HashMap<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<K, V> DerefMut for Table<K, V> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// The identifier of a peer connection, never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A remote candidate as it arrives from the signaling boundary, the
/// fields of a browser `RTCIceCandidate`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateDescriptor {
    pub candidate: Option<String>,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
    pub username_fragment: Option<String>,
}

/// Everything the signaling boundary relays to the browser about the
/// local side of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDescription {
    pub ufrag: String,
    pub pwd: String,
    /// `sha-256 AB:CD:...`
    pub fingerprint: String,
    /// `passive` for the DTLS server role, `active` for the client.
    pub setup: &'static str,
    pub candidates: Vec<String>,
    pub end_of_candidates: bool,
    pub sctp_port: Option<u16>,
}

/// # Test
///
/// ```
/// use restream_service::LocalDescription;
///
/// let description = LocalDescription {
///     ufrag: "4ZcD".to_string(),
///     pwd: "2/1muCWoOi3uLifh0NuRHlTs".to_string(),
///     fingerprint: "sha-256 AB:CD".to_string(),
///     setup: "passive",
///     candidates: vec!["candidate:1 1 udp 2130706431 192.168.1.1 5000 typ host".to_string()],
///     end_of_candidates: true,
///     sctp_port: Some(5000),
/// };
///
/// let text = description.to_string();
/// assert!(text.starts_with("a=ice-ufrag:4ZcD\r\n"));
/// assert!(text.contains("a=setup:passive\r\n"));
/// assert!(text.contains("a=candidate:1 1 udp 2130706431 192.168.1.1 5000 typ host\r\n"));
/// assert!(text.ends_with("a=sctp-port:5000\r\n"));
/// ```
impl fmt::Display for LocalDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a=ice-ufrag:{}\r\n", self.ufrag)?;
        write!(f, "a=ice-pwd:{}\r\n", self.pwd)?;
        write!(f, "a=ice-options:trickle\r\n")?;
        write!(f, "a=fingerprint:{}\r\n", self.fingerprint)?;
        write!(f, "a=setup:{}\r\n", self.setup)?;

        for candidate in &self.candidates {
            write!(f, "a={}\r\n", candidate)?;
        }

        if self.end_of_candidates {
            write!(f, "a=end-of-candidates\r\n")?;
        }

        if let Some(port) = self.sctp_port {
            write!(f, "a=sctp-port:{}\r\n", port)?;
        }

        Ok(())
    }
}

pub trait ServiceHandler: Send + Sync {
    /// connection state changed
    ///
    /// This is the notification stream the media fan-out follows: a peer
    /// joins the fan-out when it becomes `Connected` and leaves it on any
    /// other state.
    #[allow(unused_variables)]
    fn on_state_changed(&self, handle: ConnectionHandle, state: ConnectionState) {}

    /// local candidate gathered
    ///
    /// Host candidates are reported when the connection is created,
    /// server-reflexive candidates once the STUN server answered.  Both
    /// are meant to be trickled to the browser.
    #[allow(unused_variables)]
    fn on_local_candidate(&self, handle: ConnectionHandle, candidate: &Candidate) {}

    /// data channel opened, by either side.
    #[allow(unused_variables)]
    fn on_data_channel(&self, handle: ConnectionHandle, stream: u16, label: &str) {}

    /// data channel message received.
    #[allow(unused_variables)]
    fn on_message(&self, handle: ConnectionHandle, stream: u16, ppid: u32, data: &[u8]) {}

    /// connection closed
    ///
    /// Triggered once when the connection leaves the service.  Possible
    /// reasons: ICE failure, DTLS handshake failure or timeout, certificate
    /// rejection, or an explicit close.
    #[allow(unused_variables)]
    fn on_closed(&self, handle: ConnectionHandle, reason: &str) {}
}

/// A peer-facing UDP interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interface {
    /// address the socket is bound to.
    pub listen: SocketAddr,
    /// address advertised as host candidate.
    pub external: SocketAddr,
}

pub struct ServiceOptions<T> {
    pub interfaces: Vec<Interface>,
    pub peer: PeerOptions,
    pub pool_capacity: usize,
    pub buffer_size: usize,
    pub handler: T,
}

/// Restream service.
///
/// Owns every peer connection behind its own lock, the buffer pool shared
/// by all of them and the tables that route peer datagrams to their
/// connection.  The service is sans-IO like its parts: the caller feeds
/// datagrams in and drains the transmits of each connection.
#[derive(Clone)]
pub struct Service<T> {
    certificate: Arc<Certificate>,
    context: SslContext,
    pool: Arc<BufferPool>,
    connections: Arc<RwLock<Table<ConnectionHandle, Arc<Mutex<PeerConnection>>>>>,
    // local ufrag -> connection, for binding requests from new addresses.
    ufrags: Arc<RwLock<Table<String, ConnectionHandle>>>,
    // learned remote address -> connection, for everything else.
    addresses: Arc<RwLock<Table<SocketAddr, ConnectionHandle>>>,
    // outstanding STUN requests -> connection, responses carry no
    // USERNAME and may come from an address never seen before.
    transactions: Arc<RwLock<Table<[u8; 12], ConnectionHandle>>>,
    interfaces: Arc<Vec<Interface>>,
    options: Arc<PeerOptions>,
    counter: Arc<AtomicU64>,
    handler: T,
}

impl<T> Service<T>
where
    T: ServiceHandler + Clone + 'static,
{
    /// Create restream service, a fresh certificate is generated for the
    /// lifetime of the service.
    pub fn new(options: ServiceOptions<T>) -> Result<Self, Error> {
        let certificate = Certificate::generate()?;
        let context = certificate.context()?;

        Ok(Self {
            pool: BufferPool::new(options.pool_capacity, options.buffer_size),
            connections: Default::default(),
            ufrags: Default::default(),
            addresses: Default::default(),
            transactions: Default::default(),
            interfaces: Arc::new(options.interfaces),
            options: Arc::new(options.peer),
            certificate: Arc::new(certificate),
            counter: Arc::new(AtomicU64::new(0)),
            handler: options.handler,
            context,
        })
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// `sha-256` fingerprint of the local certificate.
    pub fn fingerprint(&self) -> &str {
        self.certificate.fingerprint()
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Create a peer connection for a browser that presented
    /// `remote_fingerprint` over signaling.
    ///
    /// A host candidate is gathered for every interface right away.
    pub fn create_peer_connection(
        &self,
        remote_fingerprint: &str,
        now: Instant,
    ) -> Result<ConnectionHandle, Error> {
        let handle = ConnectionHandle(self.counter.fetch_add(1, Ordering::Relaxed) + 1);
        let mut peer = PeerConnection::new(
            self.context.clone(),
            remote_fingerprint,
            self.options.as_ref().clone(),
            now,
        );

        for interface in self.interfaces.iter() {
            peer.add_local_candidate(
                Candidate::host(interface.external, 1).with_base(interface.listen),
                now,
            );
        }

        peer.complete_gathering(now);

        let mut events = Vec::new();
        while let Some(event) = peer.poll_event() {
            events.push(event);
        }

        self.ufrags
            .write()
            .insert(peer.local_credentials().ufrag.clone(), handle);
        self.connections
            .write()
            .insert(handle, Arc::new(Mutex::new(peer)));

        log::info!("peer connection created: handle={}", handle);

        self.dispatch(handle, events);
        Ok(handle)
    }

    /// Add a remote candidate.
    ///
    /// The candidate string and the media stream id are mandatory, an
    /// empty candidate string marks the end of the remote candidates.
    pub fn add_remote_candidate(
        &self,
        handle: ConnectionHandle,
        descriptor: &CandidateDescriptor,
        now: Instant,
    ) -> Result<(), Error> {
        let (Some(line), Some(_)) = (&descriptor.candidate, &descriptor.sdp_mid) else {
            return Err(Error::InvalidCandidate);
        };

        if line.trim().is_empty() {
            return Ok(());
        }

        let candidate = Candidate::parse(line)?;
        self.with_peer(handle, |peer| peer.add_remote_candidate(candidate, now))
    }

    pub fn set_remote_credentials(
        &self,
        handle: ConnectionHandle,
        ufrag: &str,
        pwd: &str,
    ) -> Result<(), Error> {
        self.with_peer(handle, |peer| peer.set_remote_credentials(ufrag, pwd))
    }

    pub fn local_description(&self, handle: ConnectionHandle) -> Result<LocalDescription, Error> {
        self.with_peer(handle, |peer| {
            let credentials = peer.local_credentials();
            LocalDescription {
                ufrag: credentials.ufrag.clone(),
                pwd: credentials.pwd.clone(),
                fingerprint: format!("sha-256 {}", self.certificate.fingerprint()),
                setup: match peer.dtls_role() {
                    DtlsRole::Server => "passive",
                    DtlsRole::Client => "active",
                },
                candidates: peer
                    .ice()
                    .local_candidates()
                    .iter()
                    .map(|it| it.to_string())
                    .collect(),
                end_of_candidates: peer.ice().is_gathering_complete(),
                sctp_port: peer.sctp_port(),
            }
        })
    }

    /// SSRC and payload type the upstream stream is rewritten to before
    /// it reaches this peer.
    pub fn set_remap(&self, handle: ConnectionHandle, remap: Option<SsrcRemap>) -> Result<(), Error> {
        self.with_peer(handle, |peer| peer.set_remap(remap))
    }

    /// Find the connection a peer-facing datagram belongs to.
    ///
    /// Binding requests are routed by the local ufrag in USERNAME, which
    /// is how a connection learns a new remote address, STUN responses by
    /// the transaction of the request they answer, anything else by the
    /// remote address learned that way.
    pub fn route(&self, source: SocketAddr, bytes: &[u8]) -> Option<ConnectionHandle> {
        if PacketKind::classify(bytes) == PacketKind::Stun {
            if let Ok(message) = Message::decode(bytes) {
                if is_response(&message) {
                    if let Some(handle) = self.transactions.read().get(message.transaction_id()) {
                        return Some(*handle);
                    }
                }

                if let Some(username) = message.get::<UserName>() {
                    let local = username.split(':').next().unwrap_or(username);
                    if let Some(handle) = self.ufrags.read().get(local) {
                        return Some(*handle);
                    }
                }
            }
        }

        self.addresses.read().get(&source).copied()
    }

    /// Process one datagram received on a peer-facing socket.
    ///
    /// Returns the connection it was routed to, `None` when it belongs to
    /// no connection and was dropped.
    pub fn handle_input(
        &self,
        source: SocketAddr,
        destination: SocketAddr,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Option<ConnectionHandle>, Error> {
        let Some(handle) = self.route(source, bytes) else {
            log::trace!("peer datagram dropped: source={}", source);
            return Ok(None);
        };

        let learned = self.with_peer(handle, |peer| {
            peer.handle_input(source, destination, bytes, now)?;

            // the ICE agent only keeps remote addresses that passed the
            // integrity check.
            Ok::<_, Error>(
                peer.ice()
                    .remote_candidates()
                    .iter()
                    .any(|it| it.address == source),
            )
        })??;

        // a connection that failed on this datagram is already gone, the
        // table lock is held so a concurrent close cannot slip in between.
        {
            let connections = self.connections.read();
            if learned && connections.contains_key(&handle) {
                self.addresses.write().insert(source, handle);
            }
        }

        if let Some(id) = response_id(bytes) {
            self.transactions.write().remove(&id);
        }

        Ok(Some(handle))
    }

    /// Encrypt one upstream RTP or RTCP datagram for a peer.
    ///
    /// The datagram is copied into a pooled buffer, its header rewritten
    /// when the peer has a remap, then protected with the peer's outbound
    /// SRTP context.  Returns `None` while the peer is not connected.
    pub fn on_inbound_media(
        &self,
        handle: ConnectionHandle,
        raw: &[u8],
        offset: usize,
        length: usize,
    ) -> Result<Option<Transmit>, Error> {
        let bytes = offset
            .checked_add(length)
            .and_then(|end| raw.get(offset..end))
            .ok_or(Error::Codec(codec::Error::MalformedHeader))?;

        let peer = self.get(handle)?;
        let mut peer = peer.lock();
        match PacketKind::classify(bytes) {
            PacketKind::Rtcp => match peer.remap() {
                // reports follow the media stream to its remapped SSRC.
                Some(remap) => {
                    let mut packet = bytes.to_vec();
                    rewrite_rtcp_sender_ssrc(&mut packet, remap.ssrc)?;
                    peer.protect(&packet, true)
                }
                None => peer.protect(bytes, true),
            },
            PacketKind::Rtp => {
                let mut packet = RtpPacket::new(self.pool.clone());
                packet.acquire(raw, offset, length)?;

                if let Some(remap) = peer.remap() {
                    let header = packet.header_mut()?;
                    header.ssrc = remap.ssrc;
                    if let Some(payload_type) = remap.payload_type {
                        header.payload_type = payload_type;
                    }

                    packet.rewrite_header()?;
                }

                let transmit = peer.protect(packet.as_bytes()?, false);
                packet.release()?;
                transmit
            }
            _ => Err(Error::Codec(codec::Error::InvalidInput)),
        }
    }

    /// Validate one upstream datagram once and encrypt it for every
    /// connected peer.
    ///
    /// A peer that fails to protect the packet is skipped, the others
    /// still get it.
    pub fn on_upstream_packet(
        &self,
        raw: &[u8],
        offset: usize,
        length: usize,
    ) -> Result<Vec<(ConnectionHandle, Transmit)>, Error> {
        validate_upstream(raw, offset, length)?;

        let mut transmits = Vec::new();
        for handle in self.connected() {
            match self.on_inbound_media(handle, raw, offset, length) {
                Ok(Some(transmit)) => transmits.push((handle, transmit)),
                Ok(None) => (),
                Err(e) => {
                    log::debug!("upstream packet not forwarded: handle={}, err={}", handle, e);
                }
            }
        }

        Ok(transmits)
    }

    /// Connections currently in the media fan-out set.
    pub fn connected(&self) -> Vec<ConnectionHandle> {
        self.connections
            .read()
            .iter()
            .filter(|(_, peer)| peer.lock().is_connected())
            .map(|(handle, _)| *handle)
            .collect()
    }

    pub fn send_data(
        &self,
        handle: ConnectionHandle,
        stream: u16,
        data: Bytes,
        binary: bool,
        now: Instant,
    ) -> Result<(), Error> {
        self.with_peer(handle, |peer| peer.send_data(stream, data, binary, now))?
    }

    pub fn open_channel(
        &self,
        handle: ConnectionHandle,
        stream: u16,
        label: &str,
        now: Instant,
    ) -> Result<(), Error> {
        self.with_peer(handle, |peer| peer.open_channel(stream, label, now))?
    }

    pub fn handle_timeout(&self, handle: ConnectionHandle, now: Instant) -> Result<(), Error> {
        self.with_peer(handle, |peer| peer.handle_timeout(now))
    }

    pub fn poll_timeout(&self, handle: ConnectionHandle) -> Option<Instant> {
        self.get(handle).ok()?.lock().poll_timeout()
    }

    /// Next datagram of a connection.
    ///
    /// STUN requests are remembered by transaction id so that their
    /// responses find the connection again.
    pub fn poll_transmit(&self, handle: ConnectionHandle) -> Option<Transmit> {
        let transmit = self.get(handle).ok()?.lock().poll_transmit()?;

        if let Some(id) = request_id(&transmit.contents) {
            // retransmits reuse the id of the first attempt.
            self.transactions.write().insert(id, handle);
        }

        Some(transmit)
    }

    pub fn state(&self, handle: ConnectionHandle) -> Option<ConnectionState> {
        Some(self.get(handle).ok()?.lock().state())
    }

    pub fn statistics(&self, handle: ConnectionHandle) -> Option<PeerStatistics> {
        Some(self.get(handle).ok()?.lock().statistics())
    }

    /// rollover counter the peer's outbound SRTP context keeps for `ssrc`.
    pub fn outbound_roc(&self, handle: ConnectionHandle, ssrc: u32) -> Option<u32> {
        self.get(handle).ok()?.lock().outbound_roc(ssrc)
    }

    /// Close a connection, idempotent.
    ///
    /// Returns the last datagrams of the connection, the SCTP abort and
    /// the DTLS close_notify.
    pub fn close_connection(&self, handle: ConnectionHandle) -> Vec<Transmit> {
        let Ok(peer) = self.get(handle) else {
            return Vec::new();
        };

        let mut transmits = Vec::new();
        let mut events = Vec::new();

        {
            let mut peer = peer.lock();
            peer.close("closed by application");

            while let Some(transmit) = peer.poll_transmit() {
                transmits.push(transmit);
            }

            while let Some(event) = peer.poll_event() {
                events.push(event);
            }
        }

        self.dispatch(handle, events);
        transmits
    }

    fn get(&self, handle: ConnectionHandle) -> Result<Arc<Mutex<PeerConnection>>, Error> {
        self.connections
            .read()
            .get(&handle)
            .cloned()
            .ok_or(Error::NotFound)
    }

    // Runs `func` under the connection lock, events are dispatched after
    // the lock is released so handlers may call back into the service.
    fn with_peer<F, R>(&self, handle: ConnectionHandle, func: F) -> Result<R, Error>
    where
        F: FnOnce(&mut PeerConnection) -> R,
    {
        let peer = self.get(handle)?;
        let mut events = Vec::new();
        let result = {
            let mut peer = peer.lock();
            let result = func(&mut peer);
            while let Some(event) = peer.poll_event() {
                events.push(event);
            }

            result
        };

        self.dispatch(handle, events);
        Ok(result)
    }

    fn dispatch(&self, handle: ConnectionHandle, events: Vec<PeerEvent>) {
        for event in events {
            match event {
                PeerEvent::StateChanged(state) => self.handler.on_state_changed(handle, state),
                PeerEvent::LocalCandidate(candidate) => {
                    self.handler.on_local_candidate(handle, &candidate)
                }
                PeerEvent::DataChannelOpened { stream, label } => {
                    self.handler.on_data_channel(handle, stream, &label)
                }
                PeerEvent::Message { stream, ppid, data } => {
                    self.handler.on_message(handle, stream, ppid, &data)
                }
                PeerEvent::Closed { reason } => {
                    self.remove(handle);
                    log::info!("peer connection closed: handle={}, reason={}", handle, reason);

                    self.handler.on_closed(handle, &reason);
                }
            }
        }
    }

    fn remove(&self, handle: ConnectionHandle) {
        self.connections.write().remove(&handle);
        self.ufrags.write().retain(|_, it| *it != handle);
        self.addresses.write().retain(|_, it| *it != handle);
        self.transactions.write().retain(|_, it| *it != handle);
    }
}

fn is_response(message: &Message<'_>) -> bool {
    matches!(
        message.class(),
        MessageClass::SuccessResponse | MessageClass::ErrorResponse
    )
}

fn request_id(bytes: &[u8]) -> Option<[u8; 12]> {
    if PacketKind::classify(bytes) != PacketKind::Stun {
        return None;
    }

    let message = Message::decode(bytes).ok()?;
    (message.class() == MessageClass::Request).then(|| *message.transaction_id())
}

fn response_id(bytes: &[u8]) -> Option<[u8; 12]> {
    if PacketKind::classify(bytes) != PacketKind::Stun {
        return None;
    }

    let message = Message::decode(bytes).ok()?;
    is_response(&message).then(|| *message.transaction_id())
}

/// Check an upstream datagram once before it is fanned out.
///
/// # Test
///
/// ```
/// use restream_service::validate_upstream;
///
/// let datagram = [
///     0x80, 0x60, 0x03, 0xe8, 0x00, 0x00, 0x00, 0x00, 0xab, 0xcd, 0x12, 0x34,
/// ];
///
/// assert!(validate_upstream(&datagram, 0, 12).is_ok());
/// assert!(validate_upstream(&datagram, 0, 13).is_err());
/// assert!(validate_upstream(&datagram, 4, 8).is_err());
/// ```
pub fn validate_upstream(raw: &[u8], offset: usize, length: usize) -> Result<PacketKind, Error> {
    let bytes = offset
        .checked_add(length)
        .and_then(|end| raw.get(offset..end))
        .ok_or(Error::Codec(codec::Error::MalformedHeader))?;

    let kind = PacketKind::classify(bytes);
    match kind {
        PacketKind::Rtp => {
            RtpHeader::decode(bytes)?;
        }
        PacketKind::Rtcp => {
            rtcp_sender_ssrc(bytes).ok_or(Error::Codec(codec::Error::MalformedHeader))?;
        }
        _ => return Err(Error::Codec(codec::Error::InvalidInput)),
    }

    Ok(kind)
}
