use crate::{
    Error, Transmit,
    dtls::{DtlsEvent, DtlsOptions, DtlsRole, DtlsSession},
    ice::{IceAgent, IceEvent, IceOptions, IceState, candidate::{Candidate, IceCredentials}},
    sctp::{
        Association, SctpEvent, SctpOptions,
        datachannel::{PPID_BINARY, PPID_BINARY_EMPTY, PPID_STRING, PPID_STRING_EMPTY},
    },
    srtp::SrtpContext,
};

use std::{
    collections::VecDeque,
    net::SocketAddr,
    time::Instant,
};

use bytes::Bytes;
use codec::{PacketKind, rtp::rtcp_sender_ssrc};
use openssl::ssl::SslContext;

/// State of a peer connection as seen by the media fan-out.
///
/// Only a `Connected` peer receives media, it is reached once the DTLS
/// handshake exported the SRTP keys over the nominated candidate pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    StateChanged(ConnectionState),
    LocalCandidate(Candidate),
    DataChannelOpened { stream: u16, label: String },
    Message { stream: u16, ppid: u32, data: Bytes },
    Closed { reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct PeerOptions {
    pub ice: IceOptions,
    pub dtls: DtlsOptions,
    /// data channels are disabled when `None`.
    pub sctp: Option<SctpOptions>,
}

/// Rewrite of the upstream stream identity before it is sent to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsrcRemap {
    pub ssrc: u32,
    pub payload_type: Option<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStatistics {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_dropped: u64,
}

/// One WebRTC peer: an ICE agent, the DTLS session running over its
/// nominated pair, the SRTP contexts of both directions and an optional
/// SCTP association for data channels.
///
/// Like its parts, the connection never touches a socket. Datagrams are
/// fed in with [`PeerConnection::handle_input`] and everything to send is
/// drained with [`PeerConnection::poll_transmit`].
pub struct PeerConnection {
    state: ConnectionState,
    options: PeerOptions,
    context: SslContext,
    remote_fingerprint: String,
    ice: IceAgent,
    dtls: Option<DtlsSession>,
    outbound: Option<SrtpContext>,
    inbound: Option<SrtpContext>,
    sctp: Option<Association>,
    remap: Option<SsrcRemap>,
    // `(local, remote)` the last DTLS record arrived on.
    dtls_path: Option<(SocketAddr, SocketAddr)>,
    statistics: PeerStatistics,
    transmits: VecDeque<Transmit>,
    events: VecDeque<PeerEvent>,
}

impl PeerConnection {
    pub fn new(
        context: SslContext,
        remote_fingerprint: &str,
        options: PeerOptions,
        now: Instant,
    ) -> Self {
        Self {
            ice: IceAgent::new(options.ice.clone(), now),
            remote_fingerprint: remote_fingerprint.to_string(),
            state: ConnectionState::New,
            transmits: VecDeque::with_capacity(16),
            events: VecDeque::with_capacity(8),
            statistics: PeerStatistics::default(),
            outbound: None,
            inbound: None,
            dtls: None,
            sctp: None,
            remap: None,
            dtls_path: None,
            context,
            options,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn ice(&self) -> &IceAgent {
        &self.ice
    }

    pub fn local_credentials(&self) -> &IceCredentials {
        self.ice.local_credentials()
    }

    pub fn dtls_role(&self) -> DtlsRole {
        self.options.dtls.role
    }

    pub fn sctp_port(&self) -> Option<u16> {
        self.options.sctp.as_ref().map(|it| it.port)
    }

    pub fn statistics(&self) -> PeerStatistics {
        self.statistics
    }

    /// rollover counter of an outbound SSRC.
    pub fn outbound_roc(&self, ssrc: u32) -> Option<u32> {
        self.outbound.as_ref().and_then(|it| it.roc(ssrc))
    }

    pub fn remap(&self) -> Option<SsrcRemap> {
        self.remap
    }

    pub fn set_remap(&mut self, remap: Option<SsrcRemap>) {
        self.remap = remap;
    }

    pub fn add_local_candidate(&mut self, candidate: Candidate, now: Instant) {
        self.ice.add_local_candidate(candidate, now);
        self.drain(now);
    }

    pub fn complete_gathering(&mut self, now: Instant) {
        self.ice.complete_gathering();
        self.drain(now);
    }

    pub fn set_remote_credentials(&mut self, ufrag: &str, pwd: &str) {
        self.ice.set_remote_credentials(ufrag, pwd);
    }

    pub fn add_remote_candidate(&mut self, candidate: Candidate, now: Instant) {
        self.ice.add_remote_candidate(candidate);
        self.drain(now);
    }

    /// Process one datagram received from the peer.
    ///
    /// STUN goes to the ICE agent, DTLS to the handshake engine, SRTP and
    /// SRTCP are authenticated and counted.  A datagram that fails to
    /// decode is dropped and returned as an error without changing the
    /// connection; handshake failures fail the whole connection.
    pub fn handle_input(
        &mut self,
        source: SocketAddr,
        destination: SocketAddr,
        bytes: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        if self.state.is_terminal() {
            return Ok(());
        }

        let result = match PacketKind::classify(bytes) {
            PacketKind::Stun => self.ice.handle_input(source, destination, bytes, now),
            PacketKind::Dtls => {
                self.dtls_path = Some((destination, source));
                self.handle_dtls(bytes, now)
            }
            PacketKind::Rtp => self.handle_srtp(bytes, false),
            PacketKind::Rtcp => self.handle_srtp(bytes, true),
            PacketKind::Unknown => Err(Error::Codec(codec::Error::InvalidInput)),
        };

        if result.is_err() {
            self.statistics.packets_dropped += 1;
        }

        self.drain(now);
        result
    }

    fn handle_dtls(&mut self, bytes: &[u8], now: Instant) -> Result<(), Error> {
        // the browser may finish its own checks and start the handshake
        // before this side nominated a pair.
        self.ensure_dtls(now)?;

        let Some(dtls) = &mut self.dtls else {
            return Ok(());
        };

        if let Err(e) = dtls.handle_input(bytes, now) {
            return Err(self.fail_with(e));
        }

        Ok(())
    }

    fn handle_srtp(&mut self, bytes: &[u8], rtcp: bool) -> Result<(), Error> {
        let Some(inbound) = &mut self.inbound else {
            return Err(Error::InvalidState);
        };

        let packet = if rtcp {
            inbound.unprotect_rtcp(bytes)?
        } else {
            inbound.unprotect_rtp(bytes)?
        };

        if rtcp {
            log::trace!(
                "peer rtcp received: ssrc={:?}, size={}",
                rtcp_sender_ssrc(&packet),
                packet.len()
            );
        }

        self.statistics.packets_received += 1;
        self.statistics.bytes_received += bytes.len() as u64;
        Ok(())
    }

    /// Protect one RTP or RTCP packet for this peer.
    ///
    /// Returns `None` while the SRTP keys are not derived yet, media sent
    /// before the connection is up is dropped.
    pub fn protect(&mut self, packet: &[u8], rtcp: bool) -> Result<Option<Transmit>, Error> {
        let (Some(outbound), Some((source, destination))) = (&mut self.outbound, self.ice.nominated())
        else {
            self.statistics.packets_dropped += 1;
            return Ok(None);
        };

        if self.state != ConnectionState::Connected {
            self.statistics.packets_dropped += 1;
            return Ok(None);
        }

        let protected = if rtcp {
            outbound.protect_rtcp(packet)?
        } else {
            outbound.protect_rtp(packet)?
        };

        self.statistics.packets_sent += 1;
        self.statistics.bytes_sent += protected.len() as u64;
        Ok(Some(Transmit {
            contents: Bytes::from(protected),
            source,
            destination,
        }))
    }

    /// Send a data channel message.
    ///
    /// Empty messages travel as a single byte with the matching "empty"
    /// PPID.
    pub fn send_data(
        &mut self,
        stream: u16,
        data: Bytes,
        binary: bool,
        now: Instant,
    ) -> Result<(), Error> {
        let Some(sctp) = &mut self.sctp else {
            return Err(Error::InvalidState);
        };

        let (ppid, data) = match (binary, data.is_empty()) {
            (true, false) => (PPID_BINARY, data),
            (false, false) => (PPID_STRING, data),
            (true, true) => (PPID_BINARY_EMPTY, Bytes::from_static(&[0])),
            (false, true) => (PPID_STRING_EMPTY, Bytes::from_static(&[0])),
        };

        sctp.send(stream, ppid, data, false, now)?;
        self.drain(now);
        Ok(())
    }

    /// Open a data channel, the stream parity follows the DTLS role.
    pub fn open_channel(&mut self, stream: u16, label: &str, now: Instant) -> Result<(), Error> {
        let Some(sctp) = &mut self.sctp else {
            return Err(Error::InvalidState);
        };

        sctp.open_channel(stream, label, now)?;
        self.drain(now);
        Ok(())
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if self.state.is_terminal() {
            return;
        }

        self.ice.handle_timeout(now);

        if let Some(dtls) = &mut self.dtls {
            if let Err(e) = dtls.handle_timeout(now) {
                self.fail_with(e);
                return;
            }
        }

        if let Some(sctp) = &mut self.sctp {
            sctp.handle_timeout(now);
        }

        self.drain(now);
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.state.is_terminal() {
            return None;
        }

        [
            self.ice.poll_timeout(),
            self.dtls.as_ref().and_then(|it| it.poll_timeout()),
            self.sctp.as_ref().and_then(|it| it.poll_timeout()),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<PeerEvent> {
        self.events.pop_front()
    }

    /// Tear down every layer, idempotent.
    ///
    /// The SCTP abort and the DTLS close_notify are still queued for
    /// transmission over the nominated pair.
    pub fn close(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }

        if let Some(sctp) = &mut self.sctp {
            sctp.abort(reason);
        }

        self.flush_sctp();

        if let Some(dtls) = &mut self.dtls {
            dtls.close();
        }

        self.flush_dtls();
        self.ice.close();

        self.outbound = None;
        self.inbound = None;
        self.terminate(ConnectionState::Closed, reason);
    }

    fn ensure_dtls(&mut self, now: Instant) -> Result<(), Error> {
        if self.dtls.is_some() {
            return Ok(());
        }

        let session = DtlsSession::new(
            &self.context,
            &self.remote_fingerprint,
            self.options.dtls.clone(),
            now,
        )
        .map_err(|e| self.fail_with(e))?;

        self.dtls = Some(session);
        Ok(())
    }

    // Moves everything the layers produced up one level: SCTP packets
    // into DTLS records, DTLS records and STUN messages into transmits,
    // layer events into connection events.
    fn drain(&mut self, now: Instant) {
        while let Some(transmit) = self.ice.poll_transmit() {
            self.transmits.push_back(transmit);
        }

        while let Some(event) = self.ice.poll_event() {
            match event {
                IceEvent::LocalCandidate(candidate) => {
                    self.events.push_back(PeerEvent::LocalCandidate(candidate));
                }
                IceEvent::Nominated { local, remote } => {
                    log::info!("peer pair nominated: local={}, remote={}", local, remote);

                    if self.ensure_dtls(now).is_err() {
                        return;
                    }
                }
                IceEvent::StateChanged(state) => self.on_ice_state(state),
            }
        }

        if self.state.is_terminal() {
            return;
        }

        let mut events = Vec::new();
        if let Some(dtls) = &mut self.dtls {
            while let Some(event) = dtls.poll_event() {
                events.push(event);
            }
        }

        for event in events {
            match event {
                DtlsEvent::Connected => self.on_dtls_connected(now),
                DtlsEvent::ApplicationData(bytes) => {
                    if let Some(sctp) = &mut self.sctp {
                        sctp.handle_input(&bytes, now);
                    }
                }
                DtlsEvent::Closed => {
                    self.terminate(ConnectionState::Closed, "dtls session closed");
                    return;
                }
            }
        }

        self.flush_sctp();

        let mut events = Vec::new();
        if let Some(sctp) = &mut self.sctp {
            while let Some(event) = sctp.poll_event() {
                events.push(event);
            }
        }

        for event in events {
            match event {
                SctpEvent::Connected => log::info!("peer sctp association established"),
                SctpEvent::DataChannelOpened { stream, label } => {
                    self.events
                        .push_back(PeerEvent::DataChannelOpened { stream, label });
                }
                SctpEvent::Message { stream, ppid, data } => {
                    self.events.push_back(PeerEvent::Message { stream, ppid, data });
                }
                SctpEvent::Closed { reason } => {
                    // the media path does not depend on the association.
                    log::warn!("peer sctp association closed: reason={}", reason);
                }
            }
        }

        self.flush_dtls();
    }

    fn on_ice_state(&mut self, state: IceState) {
        match state {
            IceState::Checking => self.set_state(ConnectionState::Checking),
            IceState::Connected | IceState::Completed => {
                if self.outbound.is_some() {
                    self.set_state(ConnectionState::Connected);
                }
            }
            IceState::Disconnected => self.set_state(ConnectionState::Disconnected),
            IceState::Failed => self.terminate(ConnectionState::Failed, "ice failed"),
            IceState::New | IceState::Gathering | IceState::Closed => (),
        }
    }

    fn on_dtls_connected(&mut self, now: Instant) {
        let Some(material) = self.dtls.as_ref().and_then(|it| it.keying_material()) else {
            return;
        };

        self.outbound = Some(SrtpContext::new(&material.local, material.profile));
        self.inbound = Some(SrtpContext::new(&material.remote, material.profile));

        log::info!(
            "peer dtls established: profile={}",
            material.profile.name()
        );

        if let Some(options) = &self.options.sctp {
            let mut sctp = Association::new(options.clone(), now);

            // the DTLS client starts the association, the server waits
            // for its INIT.
            if self.options.dtls.role == DtlsRole::Client {
                if let Err(e) = sctp.connect(now) {
                    log::warn!("peer sctp connect failed: err={}", e);
                }
            }

            self.sctp = Some(sctp);
        }

        if matches!(self.ice.state(), IceState::Connected | IceState::Completed) {
            self.set_state(ConnectionState::Connected);
        }
    }

    fn flush_sctp(&mut self) {
        let (Some(sctp), Some(dtls)) = (&mut self.sctp, &mut self.dtls) else {
            return;
        };

        while let Some(packet) = sctp.poll_transmit() {
            if let Err(e) = dtls.send(&packet) {
                log::debug!("peer sctp packet dropped: err={}", e);
            }
        }
    }

    fn flush_dtls(&mut self) {
        let Some(dtls) = &mut self.dtls else {
            return;
        };

        let nominated = self.ice.nominated();
        while let Some(contents) = dtls.poll_transmit() {
            // ICE may not have nominated a pair yet when the browser
            // started the handshake first, answer where the records came
            // from.
            let Some((source, destination)) = nominated.or(self.dtls_path) else {
                log::trace!("peer dtls record dropped: no selected pair");
                continue;
            };

            self.transmits.push_back(Transmit {
                contents,
                source,
                destination,
            });
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state || self.state.is_terminal() {
            return;
        }

        log::info!("peer state changed: {:?} -> {:?}", self.state, state);

        self.state = state;
        self.events.push_back(PeerEvent::StateChanged(state));
    }

    fn fail_with(&mut self, error: Error) -> Error {
        log::warn!("peer connection failed: err={}", error);

        self.terminate(ConnectionState::Failed, &error.to_string());
        error
    }

    fn terminate(&mut self, state: ConnectionState, reason: &str) {
        if self.state.is_terminal() {
            return;
        }

        self.set_state(state);
        self.ice.close();
        self.outbound = None;
        self.inbound = None;
        self.events.push_back(PeerEvent::Closed {
            reason: reason.to_string(),
        });
    }
}
