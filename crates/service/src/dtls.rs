//! DTLS-SRTP handshake.
//!
//! [RFC5764]: https://datatracker.ietf.org/doc/html/rfc5764
//! [RFC8842]: https://datatracker.ietf.org/doc/html/rfc8842
//!
//! The handshake runs over the nominated ICE pair.  OpenSSL drives the
//! record layer against an in-memory datagram channel, the session only
//! moves datagrams between that channel and the caller, so nothing here
//! ever touches a socket.
//!
//! Once the handshake finishes the peer certificate is matched against
//! the fingerprint carried over signaling [RFC8842], and the SRTP master
//! keys are exported exactly once [RFC5764].

use crate::{
    Error,
    srtp::{SrtpKeyingMaterial, SrtpProfile},
};

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    time::{Duration, Instant},
};

use bytes::Bytes;
use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, MsbOption},
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    ssl::{
        ErrorCode, Ssl, SslContext, SslMethod, SslOptions, SslStream, SslVerifyMode,
    },
    x509::{X509, X509NameBuilder, X509Ref, X509StoreContextRef},
};

const EXPORTER_LABEL: &str = "EXTRACTOR-dtls_srtp";
const SRTP_PROFILES: &str = "SRTP_AES128_CM_SHA1_80:SRTP_AES128_CM_SHA1_32";
const MAX_RECORD_SIZE: usize = 16384;
const MAX_FLIGHT_TIMEOUT: Duration = Duration::from_secs(60);
const KEY_LEN: usize = 16;
const SALT_LEN: usize = 14;

/// Self-signed certificate presented in every handshake.
///
/// # Test
///
/// ```
/// use restream_service::dtls::Certificate;
///
/// let certificate = Certificate::generate().unwrap();
///
/// // 32 bytes, two hex digits each, colon separated.
/// assert_eq!(certificate.fingerprint().len(), 32 * 3 - 1);
/// assert!(certificate.fingerprint().chars().all(|c| c == ':' || c.is_ascii_hexdigit()));
/// ```
#[derive(Clone)]
pub struct Certificate {
    x509: X509,
    private_key: PKey<Private>,
    fingerprint: String,
}

impl Certificate {
    /// ECDSA P-256 key with a one year self-signed certificate.
    pub fn generate() -> Result<Self, Error> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let private_key = PKey::from_ec_key(EcKey::generate(&group)?)?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COMMONNAME, "rtp-restream")?;
        let name = name.build();

        let mut serial = BigNum::new()?;
        serial.rand(128, MsbOption::MAYBE_ZERO, false)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&private_key)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;
        builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
        builder.set_not_after(Asn1Time::days_from_now(365)?.as_ref())?;
        builder.sign(&private_key, MessageDigest::sha256())?;

        let x509 = builder.build();
        Ok(Self {
            fingerprint: fingerprint(&x509)?,
            private_key,
            x509,
        })
    }

    /// uppercase colon separated SHA-256 digest of the certificate.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// DTLS context shared by all sessions presenting this certificate.
    ///
    /// The peer certificate is always requested, it is self-signed so the
    /// chain is accepted as is and only the fingerprint is checked after
    /// the handshake.
    pub fn context(&self) -> Result<SslContext, Error> {
        let mut builder = SslContext::builder(SslMethod::dtls())?;
        builder.set_read_ahead(true);
        builder.set_verify_callback(
            SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
            accept_self_signed,
        );

        builder.set_private_key(&self.private_key)?;
        builder.set_certificate(&self.x509)?;
        builder.check_private_key()?;
        builder.set_tlsext_use_srtp(SRTP_PROFILES)?;
        builder.set_options(SslOptions::NO_QUERY_MTU);
        Ok(builder.build())
    }
}

fn accept_self_signed(_: bool, _: &mut X509StoreContextRef) -> bool {
    true
}

fn fingerprint(x509: &X509Ref) -> Result<String, Error> {
    Ok(x509
        .digest(MessageDigest::sha256())?
        .iter()
        .map(|it| format!("{:02X}", it))
        .collect::<Vec<String>>()
        .join(":"))
}

/// strip the `sha-256 ` hash function prefix of an `a=fingerprint` value.
fn digest_of(fingerprint: &str) -> &str {
    let value = fingerprint.trim();
    match value.split_once(' ') {
        Some((algorithm, digest)) if algorithm.eq_ignore_ascii_case("sha-256") => digest.trim(),
        _ => value,
    }
}

/// Datagrams queued between OpenSSL and the session.
///
/// Reads never block, an empty queue reports `WouldBlock` which OpenSSL
/// turns into `WANT_READ`.
#[derive(Debug, Default)]
struct Channel {
    incoming: VecDeque<Vec<u8>>,
    outgoing: VecDeque<Vec<u8>>,
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.incoming.pop_front() {
            Some(datagram) => {
                let size = datagram.len().min(buf.len());
                buf[..size].copy_from_slice(&datagram[..size]);
                Ok(size)
            }
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// `a=setup:passive` maps to the server role, `a=setup:active` to the
/// client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DtlsRole {
    #[default]
    Server,
    Client,
}

#[derive(Debug, Clone)]
pub struct DtlsOptions {
    pub role: DtlsRole,
    pub mtu: u32,
    /// initial flight retransmission timeout, doubled on every retry.
    pub flight_timeout: Duration,
    /// retransmissions of one flight before the handshake gives up.
    pub max_flights: u32,
}

impl Default for DtlsOptions {
    fn default() -> Self {
        Self {
            role: DtlsRole::Server,
            mtu: 1200,
            flight_timeout: Duration::from_secs(1),
            max_flights: 6,
        }
    }
}

/// SRTP master keys of both directions.
///
/// `local` protects what this side sends, `remote` unprotects what the
/// peer sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyingMaterial {
    pub profile: SrtpProfile,
    pub local: SrtpKeyingMaterial,
    pub remote: SrtpKeyingMaterial,
}

impl KeyingMaterial {
    /// split the exporter output, laid out as
    /// `client key | server key | client salt | server salt`.
    fn from_exported(
        exported: &[u8; 2 * (KEY_LEN + SALT_LEN)],
        profile: SrtpProfile,
        role: DtlsRole,
    ) -> Self {
        let material = |key: usize, salt: usize| {
            let mut it = SrtpKeyingMaterial {
                master_key: [0u8; KEY_LEN],
                master_salt: [0u8; SALT_LEN],
            };

            it.master_key.copy_from_slice(&exported[key..key + KEY_LEN]);
            it.master_salt.copy_from_slice(&exported[salt..salt + SALT_LEN]);
            it
        };

        let client = material(0, 2 * KEY_LEN);
        let server = material(KEY_LEN, 2 * KEY_LEN + SALT_LEN);
        let (local, remote) = match role {
            DtlsRole::Client => (client, server),
            DtlsRole::Server => (server, client),
        };

        Self {
            profile,
            local,
            remote,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DtlsEvent {
    Connected,
    ApplicationData(Bytes),
    Closed,
}

enum State {
    Handshaking(SslStream<Channel>),
    Established(SslStream<Channel>),
    Failed,
    Closed,
}

/// One DTLS association.
///
/// A session never restarts: a failed or closed session stays that way,
/// a new handshake needs a new session.
pub struct DtlsSession {
    state: State,
    options: DtlsOptions,
    remote_fingerprint: String,
    keying_material: Option<KeyingMaterial>,
    transmits: VecDeque<Bytes>,
    events: VecDeque<DtlsEvent>,
    flight: Vec<Bytes>,
    deadline: Option<Instant>,
    interval: Duration,
    retransmits: u32,
    buffer: Box<[u8]>,
}

impl DtlsSession {
    /// Start a handshake, the client role queues its ClientHello right
    /// away.
    pub fn new(
        context: &SslContext,
        remote_fingerprint: &str,
        options: DtlsOptions,
        now: Instant,
    ) -> Result<Self, Error> {
        let mut ssl = Ssl::new(context)?;
        ssl.set_mtu(options.mtu)?;

        let stream = SslStream::new(ssl, Channel::default())?;

        let mut session = Self {
            remote_fingerprint: remote_fingerprint.to_string(),
            deadline: Some(now + options.flight_timeout),
            interval: options.flight_timeout,
            buffer: vec![0u8; MAX_RECORD_SIZE].into_boxed_slice(),
            transmits: VecDeque::with_capacity(8),
            events: VecDeque::with_capacity(4),
            keying_material: None,
            state: State::Failed,
            flight: Vec::new(),
            retransmits: 0,
            options,
        };

        session.handshake(stream, now)?;
        Ok(session)
    }

    pub fn role(&self) -> DtlsRole {
        self.options.role
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, State::Established(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Failed | State::Closed)
    }

    /// exported keys, available once the session is established.
    pub fn keying_material(&self) -> Option<&KeyingMaterial> {
        self.keying_material.as_ref()
    }

    /// Feed one DTLS datagram received from the peer.
    ///
    /// Handshake failures and certificate rejection are terminal and
    /// returned as errors, datagrams for a finished session are ignored.
    pub fn handle_input(&mut self, datagram: &[u8], now: Instant) -> Result<(), Error> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Handshaking(mut stream) => {
                stream.get_mut().incoming.push_back(datagram.to_vec());
                self.handshake(stream, now)
            }
            State::Established(mut stream) => {
                stream.get_mut().incoming.push_back(datagram.to_vec());
                self.state = State::Established(stream);
                self.read_application_data();
                Ok(())
            }
            state => {
                log::trace!("dtls datagram after close dropped: size={}", datagram.len());
                self.state = state;
                Ok(())
            }
        }
    }

    /// Retransmit the last flight once its timer expired.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), Error> {
        let Some(deadline) = self.deadline else {
            return Ok(());
        };

        if now < deadline {
            return Ok(());
        }

        if !matches!(self.state, State::Handshaking(_)) {
            self.deadline = None;
            return Ok(());
        }

        if self.retransmits >= self.options.max_flights {
            log::warn!("dtls handshake timeout: flights={}", self.retransmits);

            self.fail();
            return Err(Error::HandshakeTimeout);
        }

        self.retransmits += 1;
        self.interval = (self.interval * 2).min(MAX_FLIGHT_TIMEOUT);
        self.deadline = Some(now + self.interval);
        self.transmits.extend(self.flight.iter().cloned());

        log::debug!(
            "dtls flight retransmitted: count={}, datagrams={}",
            self.retransmits,
            self.flight.len()
        );

        Ok(())
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<DtlsEvent> {
        self.events.pop_front()
    }

    /// Send application data, SCTP packets in practice.
    pub fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        let State::Established(stream) = &mut self.state else {
            return Err(Error::InvalidState);
        };

        let result = stream.ssl_write(data);
        let outgoing = stream.get_mut().outgoing.drain(..).map(Bytes::from);
        self.transmits.extend(outgoing);

        result.map(|_| ()).map_err(|e| {
            log::warn!("dtls write failed: err={}", e);
            Error::Closed
        })
    }

    /// Send close_notify and finish the session, idempotent.
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Established(mut stream) => {
                let _ = stream.shutdown();
                let outgoing = stream.get_mut().outgoing.drain(..).map(Bytes::from);
                self.transmits.extend(outgoing);
                self.events.push_back(DtlsEvent::Closed);
            }
            State::Handshaking(_) => {
                self.events.push_back(DtlsEvent::Closed);
            }
            State::Failed => {
                self.state = State::Failed;
            }
            State::Closed => (),
        }

        self.deadline = None;
    }

    /// Run the handshake as far as the queued datagrams allow, the role
    /// decides whether OpenSSL accepts or connects.
    fn handshake(&mut self, mut stream: SslStream<Channel>, now: Instant) -> Result<(), Error> {
        let result = match self.options.role {
            DtlsRole::Server => stream.accept(),
            DtlsRole::Client => stream.connect(),
        };

        let outgoing: Vec<Bytes> = stream.get_mut().outgoing.drain(..).map(Bytes::from).collect();

        match result {
            Ok(()) => {
                self.on_flight(outgoing, now);
                self.state = State::Established(stream);
                self.on_established()
            }
            Err(e) if e.code() == ErrorCode::WANT_READ || e.code() == ErrorCode::WANT_WRITE => {
                self.on_flight(outgoing, now);
                self.state = State::Handshaking(stream);
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.transmits.extend(outgoing);

                log::warn!("dtls handshake failed: reason={}", reason);

                self.fail();
                Err(Error::HandshakeFailed(reason))
            }
        }
    }

    /// a new flight restarts the retransmission timer.
    fn on_flight(&mut self, datagrams: Vec<Bytes>, now: Instant) {
        if datagrams.is_empty() {
            return;
        }

        self.transmits.extend(datagrams.iter().cloned());
        self.flight = datagrams;
        self.retransmits = 0;
        self.interval = self.options.flight_timeout;
        self.deadline = Some(now + self.interval);
    }

    fn on_established(&mut self) -> Result<(), Error> {
        let result = match &self.state {
            State::Established(stream) => {
                verify_and_export(stream, &self.remote_fingerprint, self.options.role)
            }
            _ => return Ok(()),
        };

        match result {
            Ok(keying_material) => {
                if self.keying_material.is_none() {
                    self.keying_material = Some(keying_material);
                }

                self.deadline = None;
                self.flight.clear();
                self.events.push_back(DtlsEvent::Connected);
                self.read_application_data();
                Ok(())
            }
            Err(e) => {
                log::warn!("dtls peer rejected: err={:?}", e);

                self.fail();
                Err(e)
            }
        }
    }

    fn read_application_data(&mut self) {
        let State::Established(stream) = &mut self.state else {
            return;
        };

        let mut closed = false;
        loop {
            match stream.ssl_read(&mut self.buffer) {
                Ok(0) => break,
                Ok(size) => self.events.push_back(DtlsEvent::ApplicationData(
                    Bytes::copy_from_slice(&self.buffer[..size]),
                )),
                Err(e) if e.code() == ErrorCode::WANT_READ => break,
                Err(e) if e.code() == ErrorCode::ZERO_RETURN => {
                    closed = true;
                    break;
                }
                Err(e) => {
                    log::warn!("dtls read failed: err={}", e);

                    closed = true;
                    break;
                }
            }
        }

        self.transmits.extend(stream.get_mut().outgoing.drain(..).map(Bytes::from));

        if closed {
            self.state = State::Closed;
            self.deadline = None;
            self.events.push_back(DtlsEvent::Closed);
        }
    }

    fn fail(&mut self) {
        self.state = State::Failed;
        self.deadline = None;
        self.flight.clear();
    }
}

/// match the peer certificate against the signaled fingerprint, then
/// export the SRTP keys of the negotiated profile.
fn verify_and_export(
    stream: &SslStream<Channel>,
    expected: &str,
    role: DtlsRole,
) -> Result<KeyingMaterial, Error> {
    let ssl = stream.ssl();

    let certificate = ssl.peer_certificate().ok_or(Error::CertificateRejected)?;
    if !fingerprint(&certificate)?.eq_ignore_ascii_case(digest_of(expected)) {
        return Err(Error::CertificateRejected);
    }

    let profile = match ssl.selected_srtp_profile().map(|it| it.name()) {
        Some("SRTP_AES128_CM_SHA1_80") => SrtpProfile::Aes128CmSha1_80,
        Some("SRTP_AES128_CM_SHA1_32") => SrtpProfile::Aes128CmSha1_32,
        _ => return Err(Error::HandshakeFailed("no srtp profile negotiated".to_string())),
    };

    let mut exported = [0u8; 2 * (KEY_LEN + SALT_LEN)];
    ssl.export_keying_material(&mut exported, EXPORTER_LABEL, None)?;
    Ok(KeyingMaterial::from_exported(&exported, profile, role))
}
