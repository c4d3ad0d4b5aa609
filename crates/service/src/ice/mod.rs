//! Interactive Connectivity Establishment.
//!
//! [RFC8445]: https://datatracker.ietf.org/doc/html/rfc8445
//! [RFC7675]: https://datatracker.ietf.org/doc/html/rfc7675
//!
//! A full agent that always takes the controlled role, the
//! browser makes the offer and is the controlling agent.  The agent still
//! runs its own connectivity checks so that a path is proven in both
//! directions before media flows, and the first pair that succeeds is
//! nominated for the lifetime of the session.
//!
//! The agent is sans-IO: datagrams come in through
//! [`IceAgent::handle_input`], clocks through [`IceAgent::handle_timeout`],
//! and everything to be sent is drained with [`IceAgent::poll_transmit`].

pub mod candidate;

use self::candidate::{Candidate, CandidateKind, IceCredentials, Transport, priority};
use crate::{Error, Transmit};

use std::{
    cmp::Reverse,
    collections::VecDeque,
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use codec::stun::{
    Message, MessageEncoder,
    attributes::{
        AttributeType, ErrorCode, IceControlled, Priority, UserName, XorMappedAddress,
        error::ErrorType,
    },
    methods::{BINDING_ERROR, BINDING_REQUEST, BINDING_RESPONSE, MessageClass, Method},
};
use rand::Rng;

/// RTP and RTCP are multiplexed, only component 1 exists.
const COMPONENT_RTP: u16 = 1;
const MAX_BACKOFF_SHIFT: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IceState {
    New,
    Gathering,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceState {
    /// no transition ever leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

impl PairState {
    /// # Test
    ///
    /// ```
    /// use restream_service::ice::PairState;
    ///
    /// assert!(PairState::Frozen.can_transition(PairState::Waiting));
    /// assert!(PairState::InProgress.can_transition(PairState::Failed));
    /// assert!(!PairState::Frozen.can_transition(PairState::InProgress));
    /// assert!(!PairState::Succeeded.can_transition(PairState::Failed));
    /// ```
    #[rustfmt::skip]
    pub fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Frozen,     Self::Waiting)    |
            (Self::Waiting,    Self::InProgress) |
            (Self::InProgress, Self::Succeeded)  |
            (Self::InProgress, Self::Failed)
        )
    }
}

/// Pair priority as computed by the controlled agent, where `G` is the
/// priority of the remote (controlling) candidate and `D` the priority
/// of the local candidate.
///
/// ```text
/// pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
/// ```
///
/// # Test
///
/// ```
/// use restream_service::ice::pair_priority;
///
/// assert_eq!(pair_priority(2, 1), (1 << 32) + 4 + 1);
/// assert_eq!(pair_priority(1, 2), (1 << 32) + 4);
/// ```
pub fn pair_priority(controlling: u32, controlled: u32) -> u64 {
    let (g, d) = (controlling as u64, controlled as u64);
    (g.min(d) << 32) + 2 * g.max(d) + if g > d { 1 } else { 0 }
}

#[derive(Debug, Clone)]
struct Transaction {
    id: [u8; 12],
    contents: Bytes,
    deadline: Instant,
    retransmits: u32,
}

#[derive(Debug, Clone)]
pub struct CandidatePair {
    local: SocketAddr,
    remote: SocketAddr,
    foundation: String,
    component: u16,
    priority: u64,
    state: PairState,
    transaction: Option<Transaction>,
}

impl CandidatePair {
    /// base address of the local candidate.
    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn foundation(&self) -> &str {
        &self.foundation
    }

    pub fn priority(&self) -> u64 {
        self.priority
    }

    pub fn state(&self) -> PairState {
        self.state
    }

    fn transition(&mut self, next: PairState) -> bool {
        if !self.state.can_transition(next) {
            return false;
        }

        log::trace!(
            "ice pair state: local={}, remote={}, {:?} -> {:?}",
            self.local,
            self.remote,
            self.state,
            next
        );

        self.state = next;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceEvent {
    StateChanged(IceState),
    LocalCandidate(Candidate),
    Nominated {
        local: SocketAddr,
        remote: SocketAddr,
    },
}

#[derive(Debug, Clone)]
pub struct IceOptions {
    /// pacing between two connectivity checks (Ta).
    pub check_interval: Duration,
    /// initial retransmission timeout of a check.
    pub rto: Duration,
    pub max_retransmits: u32,
    pub consent_interval: Duration,
    /// no consent response within this window fails the session.
    pub consent_timeout: Duration,
    /// no nominated pair within this window fails the session.
    pub gathering_timeout: Duration,
    /// server used to learn server-reflexive candidates.
    pub stun_server: Option<SocketAddr>,
}

impl Default for IceOptions {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(50),
            rto: Duration::from_millis(250),
            max_retransmits: 7,
            consent_interval: Duration::from_secs(5),
            consent_timeout: Duration::from_secs(30),
            gathering_timeout: Duration::from_secs(30),
            stun_server: None,
        }
    }
}

/// A binding request to the STUN server for one host candidate.
#[derive(Debug)]
struct Gather {
    base: SocketAddr,
    server: SocketAddr,
    transaction: Transaction,
}

#[derive(Debug)]
struct Consent {
    pending: Option<[u8; 12]>,
    last_response: Instant,
    next: Instant,
}

pub struct IceAgent {
    state: IceState,
    options: IceOptions,
    local_credentials: IceCredentials,
    remote_credentials: Option<IceCredentials>,
    tie_breaker: u64,
    local_candidates: Vec<Candidate>,
    remote_candidates: Vec<Candidate>,
    pairs: Vec<CandidatePair>,
    triggered: VecDeque<usize>,
    nominated: Option<usize>,
    gathers: Vec<Gather>,
    end_of_candidates: bool,
    consent: Option<Consent>,
    epoch: Instant,
    deadline: Instant,
    next_check: Option<Instant>,
    transmits: VecDeque<Transmit>,
    events: VecDeque<IceEvent>,
    buffer: BytesMut,
}

impl IceAgent {
    pub fn new(options: IceOptions, now: Instant) -> Self {
        Self::with_credentials(IceCredentials::generate(), options, now)
    }

    pub fn with_credentials(credentials: IceCredentials, options: IceOptions, now: Instant) -> Self {
        Self {
            deadline: now + options.gathering_timeout,
            tie_breaker: rand::rng().random(),
            local_credentials: credentials,
            transmits: VecDeque::with_capacity(16),
            events: VecDeque::with_capacity(16),
            buffer: BytesMut::with_capacity(1500),
            remote_credentials: None,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            triggered: VecDeque::new(),
            end_of_candidates: false,
            gathers: Vec::new(),
            pairs: Vec::with_capacity(8),
            state: IceState::New,
            next_check: None,
            nominated: None,
            consent: None,
            epoch: now,
            options,
        }
    }

    pub fn state(&self) -> IceState {
        self.state
    }

    pub fn local_credentials(&self) -> &IceCredentials {
        &self.local_credentials
    }

    pub fn local_candidates(&self) -> &[Candidate] {
        &self.local_candidates
    }

    pub fn remote_candidates(&self) -> &[Candidate] {
        &self.remote_candidates
    }

    pub fn pairs(&self) -> &[CandidatePair] {
        &self.pairs
    }

    /// `(local base, remote)` of the nominated pair.
    pub fn nominated(&self) -> Option<(SocketAddr, SocketAddr)> {
        self.nominated
            .map(|index| (self.pairs[index].local, self.pairs[index].remote))
    }

    /// Add a local candidate, host candidates also start server-reflexive
    /// gathering when a STUN server is configured.
    pub fn add_local_candidate(&mut self, candidate: Candidate, now: Instant) {
        if self.state.is_terminal() || self.local_candidates.contains(&candidate) {
            return;
        }

        if self.state == IceState::New {
            self.set_state(IceState::Gathering);
        }

        if candidate.kind == CandidateKind::Host {
            if let Some(server) = self.options.stun_server {
                if server.is_ipv4() == candidate.base.is_ipv4() {
                    self.start_gather(candidate.base, server, now);
                }
            }
        }

        self.events
            .push_back(IceEvent::LocalCandidate(candidate.clone()));
        self.local_candidates.push(candidate);

        let local = self.local_candidates.len() - 1;
        for remote in 0..self.remote_candidates.len() {
            self.form_pair(local, remote);
        }
    }

    /// no more local candidates will be added.
    pub fn complete_gathering(&mut self) {
        self.end_of_candidates = true;
        self.update_completed();
    }

    pub fn is_gathering_complete(&self) -> bool {
        self.end_of_candidates && self.gathers.is_empty()
    }

    pub fn set_remote_credentials(&mut self, ufrag: &str, pwd: &str) {
        self.remote_credentials = Some(IceCredentials {
            ufrag: ufrag.to_string(),
            pwd: pwd.to_string(),
        });
    }

    /// Add a candidate received over signaling.
    ///
    /// TCP candidates and RTCP components are accepted but never paired.
    pub fn add_remote_candidate(&mut self, candidate: Candidate) {
        if self.state.is_terminal() {
            return;
        }

        if candidate.transport != Transport::Udp || candidate.component != COMPONENT_RTP {
            log::debug!("ice remote candidate skipped: candidate={}", candidate);
            return;
        }

        if self
            .remote_candidates
            .iter()
            .any(|it| it.address == candidate.address)
        {
            return;
        }

        self.remote_candidates.push(candidate);

        let remote = self.remote_candidates.len() - 1;
        for local in 0..self.local_candidates.len() {
            self.form_pair(local, remote);
        }
    }

    /// Process one STUN datagram.
    ///
    /// Requests are authenticated with the local credentials, responses
    /// with the remote ones; a datagram that fails to decode is returned
    /// as an error and changes nothing.
    pub fn handle_input(
        &mut self,
        source: SocketAddr,
        destination: SocketAddr,
        bytes: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        let message = Message::decode(bytes)?;
        if self.state.is_terminal() {
            return Ok(());
        }

        match message.class() {
            MessageClass::Request => self.handle_request(source, destination, &message, now),
            MessageClass::SuccessResponse | MessageClass::ErrorResponse => {
                self.handle_response(source, destination, &message, now)
            }
            MessageClass::Indication => (),
        }

        Ok(())
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if self.state.is_terminal() {
            return;
        }

        if self.nominated.is_none() && now >= self.deadline {
            log::warn!("ice no pair nominated before deadline");

            self.set_state(IceState::Failed);
            return;
        }

        self.retransmit_gathers(now);
        self.retransmit_checks(now);

        if self.remote_credentials.is_some() && self.next_check.is_none_or(|it| now >= it) {
            match self.next_pair() {
                Some(index) => {
                    self.send_check(index, now);
                    self.next_check = Some(now + self.options.check_interval);
                }
                None => self.next_check = None,
            }
        }

        self.check_consent(now);
        self.update_completed();
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.state.is_terminal() {
            return None;
        }

        let mut deadline = if self.nominated.is_none() {
            Some(self.deadline)
        } else {
            None
        };

        let transactions = self
            .pairs
            .iter()
            .filter_map(|it| it.transaction.as_ref())
            .chain(self.gathers.iter().map(|it| &it.transaction));

        for transaction in transactions {
            deadline = earliest(deadline, transaction.deadline);
        }

        if let Some(consent) = &self.consent {
            deadline = earliest(deadline, consent.next);
        }

        if self.has_pending_checks() {
            deadline = earliest(deadline, self.next_check.unwrap_or(self.epoch));
        }

        deadline
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<IceEvent> {
        self.events.pop_front()
    }

    /// Stop all checks, idempotent.
    pub fn close(&mut self) {
        for pair in &mut self.pairs {
            pair.transaction = None;
        }

        self.triggered.clear();
        self.gathers.clear();
        self.consent = None;
        self.next_check = None;
        self.set_state(IceState::Closed);
    }

    fn set_state(&mut self, next: IceState) {
        if self.state == next || self.state.is_terminal() {
            return;
        }

        log::info!("ice state changed: {:?} -> {:?}", self.state, next);

        self.state = next;
        self.events.push_back(IceEvent::StateChanged(next));
    }

    fn form_pair(&mut self, local: usize, remote: usize) {
        let (local, remote) = (&self.local_candidates[local], &self.remote_candidates[remote]);

        // reflexive candidates share the base of a host candidate, which
        // already forms the same pair.
        if local.kind != CandidateKind::Host
            || local.component != remote.component
            || local.base.is_ipv4() != remote.address.is_ipv4()
        {
            return;
        }

        if self
            .pairs
            .iter()
            .any(|it| it.local == local.base && it.remote == remote.address)
        {
            return;
        }

        self.pairs.push(CandidatePair {
            foundation: format!("{}:{}", local.foundation, remote.foundation),
            priority: pair_priority(remote.priority, local.priority),
            state: PairState::Frozen,
            component: local.component,
            remote: remote.address,
            local: local.base,
            transaction: None,
        });
    }

    fn has_pending_checks(&self) -> bool {
        self.remote_credentials.is_some()
            && (!self.triggered.is_empty()
                || self
                    .pairs
                    .iter()
                    .any(|it| matches!(it.state, PairState::Frozen | PairState::Waiting)))
    }

    /// the triggered queue goes first, then the highest priority waiting
    /// pair.
    fn next_pair(&mut self) -> Option<usize> {
        while let Some(index) = self.triggered.pop_front() {
            if self.pairs[index].state == PairState::Waiting {
                return Some(index);
            }
        }

        self.unfreeze();
        self.pairs
            .iter()
            .enumerate()
            .filter(|(_, it)| it.state == PairState::Waiting)
            .max_by_key(|(_, it)| it.priority)
            .map(|(index, _)| index)
    }

    /// each foundation without a check in flight gets its best frozen
    /// pair unfrozen.
    fn unfreeze(&mut self) {
        let mut active: Vec<String> = self
            .pairs
            .iter()
            .filter(|it| matches!(it.state, PairState::Waiting | PairState::InProgress))
            .map(|it| it.foundation.clone())
            .collect();

        let mut frozen: Vec<usize> = (0..self.pairs.len())
            .filter(|index| self.pairs[*index].state == PairState::Frozen)
            .collect();

        frozen.sort_by_key(|index| Reverse(self.pairs[*index].priority));

        for index in frozen {
            let pair = &mut self.pairs[index];
            if !active.contains(&pair.foundation) {
                active.push(pair.foundation.clone());
                pair.transition(PairState::Waiting);
            }
        }
    }

    /// A connectivity check, signed with the remote password.
    fn binding_request(&mut self, component: u16) -> Option<([u8; 12], Bytes)> {
        let remote = self.remote_credentials.as_ref()?;
        let username = format!("{}:{}", remote.ufrag, self.local_credentials.ufrag);
        let id = transaction_id();

        {
            let mut message = MessageEncoder::new(BINDING_REQUEST, &id, &mut self.buffer);
            message.append::<UserName>(username.as_str());
            message.append::<Priority>(priority(CandidateKind::PeerReflexive, 65535, component));
            message.append::<IceControlled>(self.tie_breaker);
            message.flush(Some(remote.pwd.as_bytes()));
        }

        Some((id, Bytes::copy_from_slice(&self.buffer)))
    }

    fn send_check(&mut self, index: usize, now: Instant) {
        let Some((id, contents)) = self.binding_request(self.pairs[index].component) else {
            return;
        };

        let pair = &mut self.pairs[index];
        if !pair.transition(PairState::InProgress) {
            return;
        }

        self.transmits.push_back(Transmit {
            contents: contents.clone(),
            destination: pair.remote,
            source: pair.local,
        });

        pair.transaction = Some(Transaction {
            deadline: now + self.options.rto,
            retransmits: 0,
            contents,
            id,
        });

        if matches!(self.state, IceState::New | IceState::Gathering) {
            self.set_state(IceState::Checking);
        }
    }

    fn retransmit_checks(&mut self, now: Instant) {
        let mut changed = false;

        for pair in &mut self.pairs {
            let Some(transaction) = &mut pair.transaction else {
                continue;
            };

            if now < transaction.deadline {
                continue;
            }

            if transaction.retransmits >= self.options.max_retransmits {
                log::debug!(
                    "ice check timeout: local={}, remote={}",
                    pair.local,
                    pair.remote
                );

                pair.transaction = None;
                pair.transition(PairState::Failed);
                changed = true;
                continue;
            }

            transaction.retransmits += 1;
            transaction.deadline =
                now + self.options.rto * (1 << transaction.retransmits.min(MAX_BACKOFF_SHIFT));

            self.transmits.push_back(Transmit {
                contents: transaction.contents.clone(),
                destination: pair.remote,
                source: pair.local,
            });
        }

        if changed {
            self.update_completed();
        }
    }

    fn start_gather(&mut self, base: SocketAddr, server: SocketAddr, now: Instant) {
        let id = transaction_id();

        MessageEncoder::new(BINDING_REQUEST, &id, &mut self.buffer).flush(None);
        let contents = Bytes::copy_from_slice(&self.buffer);

        self.transmits.push_back(Transmit {
            contents: contents.clone(),
            destination: server,
            source: base,
        });

        self.gathers.push(Gather {
            transaction: Transaction {
                deadline: now + self.options.rto,
                retransmits: 0,
                contents,
                id,
            },
            server,
            base,
        });
    }

    fn retransmit_gathers(&mut self, now: Instant) {
        let max_retransmits = self.options.max_retransmits;
        let rto = self.options.rto;
        let before = self.gathers.len();

        self.gathers.retain(|it| {
            it.transaction.retransmits < max_retransmits || now < it.transaction.deadline
        });

        if self.gathers.len() != before {
            log::warn!("ice server reflexive gathering timeout");
        }

        for gather in &mut self.gathers {
            let transaction = &mut gather.transaction;
            if now < transaction.deadline {
                continue;
            }

            transaction.retransmits += 1;
            transaction.deadline = now + rto * (1 << transaction.retransmits.min(MAX_BACKOFF_SHIFT));

            self.transmits.push_back(Transmit {
                contents: transaction.contents.clone(),
                destination: gather.server,
                source: gather.base,
            });
        }
    }

    fn handle_request(
        &mut self,
        source: SocketAddr,
        destination: SocketAddr,
        message: &Message<'_>,
        now: Instant,
    ) {
        if message.method() != Method::Binding {
            return self.reject(source, destination, message, ErrorType::BadRequest);
        }

        // USERNAME of an inbound check is "LFRAG:RFRAG" from our side.
        let Some(username) = message.get::<UserName>() else {
            return self.reject(source, destination, message, ErrorType::BadRequest);
        };

        if username.split(':').next() != Some(self.local_credentials.ufrag.as_str()) {
            return self.reject(source, destination, message, ErrorType::Unauthorized);
        }

        match message.verify_integrity(self.local_credentials.pwd.as_bytes()) {
            Err(codec::Error::NotFoundIntegrity) => {
                return self.reject(source, destination, message, ErrorType::BadRequest);
            }
            Err(_) => {
                return self.reject(source, destination, message, ErrorType::Unauthorized);
            }
            Ok(_) => (),
        }

        if message.contains(AttributeType::Fingerprint) && message.verify_fingerprint().is_err() {
            return;
        }

        // both agents claim the controlled role, the controlled role is
        // never given up here.
        if message.get::<IceControlled>().is_some() {
            return self.reject(source, destination, message, ErrorType::RoleConflict);
        }

        {
            let mut response = MessageEncoder::extend(BINDING_RESPONSE, message, &mut self.buffer);
            response.append::<XorMappedAddress>(source);
            response.flush(Some(self.local_credentials.pwd.as_bytes()));
        }

        self.transmits.push_back(Transmit {
            contents: Bytes::copy_from_slice(&self.buffer),
            destination: source,
            source: destination,
        });

        if !self.remote_candidates.iter().any(|it| it.address == source) {
            let Some(priority) = message.get::<Priority>() else {
                return;
            };

            log::debug!("ice peer reflexive candidate: addr={}", source);

            self.add_remote_candidate(Candidate::peer_reflexive(source, priority, COMPONENT_RTP));
        }

        let Some(index) = self
            .pairs
            .iter()
            .position(|it| it.local == destination && it.remote == source)
        else {
            return;
        };

        match self.pairs[index].state {
            PairState::Frozen => {
                self.pairs[index].transition(PairState::Waiting);
                self.triggered.push_back(index);
            }
            PairState::Waiting => {
                self.triggered.push_back(index);
            }
            PairState::Succeeded if message.contains(AttributeType::UseCandidate) => {
                self.on_pair_succeeded(index, now);
            }
            _ => (),
        }

        if !self.triggered.is_empty() && self.next_check.is_none() {
            self.next_check = Some(now);
        }
    }

    fn reject(
        &mut self,
        source: SocketAddr,
        destination: SocketAddr,
        message: &Message<'_>,
        error: ErrorType,
    ) {
        log::debug!("ice check rejected: addr={}, error={:?}", source, error);

        {
            let mut response = MessageEncoder::extend(BINDING_ERROR, message, &mut self.buffer);
            response.append::<ErrorCode>(ErrorCode::from(error));

            // 400 and 401 must not carry integrity, the peer is not
            // known to share our password.
            if error == ErrorType::RoleConflict {
                response.flush(Some(self.local_credentials.pwd.as_bytes()));
            } else {
                response.flush(None);
            }
        }

        self.transmits.push_back(Transmit {
            contents: Bytes::copy_from_slice(&self.buffer),
            destination: source,
            source: destination,
        });
    }

    fn handle_response(
        &mut self,
        source: SocketAddr,
        destination: SocketAddr,
        message: &Message<'_>,
        now: Instant,
    ) {
        let id = *message.transaction_id();

        if let Some(index) = self
            .pairs
            .iter()
            .position(|it| it.transaction.as_ref().is_some_and(|t| t.id == id))
        {
            return self.on_check_response(index, source, destination, message, now);
        }

        if self
            .consent
            .as_ref()
            .is_some_and(|it| it.pending == Some(id))
        {
            return self.on_consent_response(message, now);
        }

        if let Some(index) = self.gathers.iter().position(|it| it.transaction.id == id) {
            let gather = self.gathers.remove(index);
            return self.on_gather_response(gather, message);
        }

        log::trace!("ice response without transaction: addr={}", source);
    }

    fn on_check_response(
        &mut self,
        index: usize,
        source: SocketAddr,
        destination: SocketAddr,
        message: &Message<'_>,
        now: Instant,
    ) {
        let Some(remote) = &self.remote_credentials else {
            return;
        };

        if message.verify_integrity(remote.pwd.as_bytes()).is_err() {
            log::debug!("ice response integrity failed: addr={}", source);
            return;
        }

        let pair = &mut self.pairs[index];
        pair.transaction = None;

        // the response must come back on the same 5-tuple the check
        // went out on.
        if message.class() == MessageClass::ErrorResponse
            || pair.remote != source
            || pair.local != destination
        {
            pair.transition(PairState::Failed);
            self.update_completed();
            return;
        }

        if pair.transition(PairState::Succeeded) {
            self.on_pair_succeeded(index, now);
        }
    }

    /// the first pair that succeeds is nominated, and stays nominated.
    fn on_pair_succeeded(&mut self, index: usize, now: Instant) {
        if self.nominated.is_some() {
            self.update_completed();
            return;
        }

        let pair = &self.pairs[index];
        log::info!("ice pair nominated: local={}, remote={}", pair.local, pair.remote);

        self.events.push_back(IceEvent::Nominated {
            local: pair.local,
            remote: pair.remote,
        });

        self.nominated = Some(index);
        self.consent = Some(Consent {
            next: now + self.options.consent_interval,
            last_response: now,
            pending: None,
        });

        self.set_state(IceState::Connected);
        self.update_completed();
    }

    fn on_consent_response(&mut self, message: &Message<'_>, now: Instant) {
        let Some(remote) = &self.remote_credentials else {
            return;
        };

        if message.class() != MessageClass::SuccessResponse
            || message.verify_integrity(remote.pwd.as_bytes()).is_err()
        {
            return;
        }

        if let Some(consent) = &mut self.consent {
            consent.pending = None;
            consent.last_response = now;
        }

        if self.state == IceState::Disconnected {
            self.set_state(IceState::Connected);
        }
    }

    fn on_gather_response(&mut self, gather: Gather, message: &Message<'_>) {
        let Some(address) = message.get::<XorMappedAddress>() else {
            log::warn!("ice server reflexive gathering failed: server={}", gather.server);
            return self.update_completed();
        };

        if address != gather.base
            && !self.local_candidates.iter().any(|it| it.address == address)
        {
            let candidate = Candidate::server_reflexive(address, gather.base, COMPONENT_RTP);

            log::info!("ice server reflexive candidate: addr={}", address);

            self.events
                .push_back(IceEvent::LocalCandidate(candidate.clone()));
            self.local_candidates.push(candidate);
        }

        self.update_completed();
    }

    /// Consent freshness on the nominated pair.
    fn check_consent(&mut self, now: Instant) {
        let (Some(index), Some(consent)) = (self.nominated, &self.consent) else {
            return;
        };

        let elapsed = now.saturating_duration_since(consent.last_response);
        let send = now >= consent.next;

        if elapsed >= self.options.consent_timeout {
            log::warn!("ice consent expired: elapsed={:?}", elapsed);

            self.set_state(IceState::Failed);
            return;
        }

        if elapsed >= self.options.consent_interval * 2
            && matches!(self.state, IceState::Connected | IceState::Completed)
        {
            self.set_state(IceState::Disconnected);
        }

        if !send {
            return;
        }

        let component = self.pairs[index].component;
        let Some((id, contents)) = self.binding_request(component) else {
            return;
        };

        self.transmits.push_back(Transmit {
            destination: self.pairs[index].remote,
            source: self.pairs[index].local,
            contents,
        });

        if let Some(consent) = &mut self.consent {
            consent.pending = Some(id);
            consent.next = now + self.options.consent_interval;
        }
    }

    /// Connected becomes Completed once gathering is over and no pair of
    /// higher priority is still being checked.
    fn update_completed(&mut self) {
        if self.state != IceState::Connected || !self.is_gathering_complete() {
            return;
        }

        let Some(index) = self.nominated else {
            return;
        };

        let best = self.pairs[index].priority;
        if self.pairs.iter().any(|it| {
            it.priority > best
                && matches!(
                    it.state,
                    PairState::Frozen | PairState::Waiting | PairState::InProgress
                )
        }) {
            return;
        }

        self.set_state(IceState::Completed);
    }
}

fn transaction_id() -> [u8; 12] {
    let mut id = [0u8; 12];
    rand::rng().fill(&mut id);
    id
}

fn earliest(current: Option<Instant>, other: Instant) -> Option<Instant> {
    Some(current.map_or(other, |it| it.min(other)))
}
