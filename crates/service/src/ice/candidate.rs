use crate::Error;

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use base64::{Engine, prelude::BASE64_STANDARD_NO_PAD};
use codec::crypto::crc32c;
use rand::Rng;

/// The RECOMMENDED values for type preferences are 126 for host
/// candidates, 110 for peer-reflexive candidates, 100 for server-
/// reflexive candidates, and 0 for relayed candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relayed,
}

impl CandidateKind {
    #[rustfmt::skip]
    pub fn preference(self) -> u32 {
        match self {
            Self::Host            => 126,
            Self::PeerReflexive   => 110,
            Self::ServerReflexive => 100,
            Self::Relayed         => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relayed => "relay",
        }
    }
}

impl FromStr for CandidateKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "host" => Self::Host,
            "srflx" => Self::ServerReflexive,
            "prflx" => Self::PeerReflexive,
            "relay" => Self::Relayed,
            _ => return Err(Error::InvalidCandidate),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
}

/// Priority of a candidate.
///
/// ```text
/// priority = (2^24)*(type preference) +
///            (2^8)*(local preference) +
///            (2^0)*(256 - component ID)
/// ```
///
/// # Test
///
/// ```
/// use restream_service::ice::candidate::{CandidateKind, priority};
///
/// assert_eq!(priority(CandidateKind::Host, 65535, 1), 2130706431);
/// assert_eq!(priority(CandidateKind::ServerReflexive, 65535, 1), 1694498815);
/// assert_eq!(priority(CandidateKind::Relayed, 0, 2), 254);
/// ```
pub fn priority(kind: CandidateKind, local_preference: u16, component: u16) -> u32 {
    (kind.preference() << 24) | ((local_preference as u32) << 8) | (256 - component.min(256) as u32)
}

/// An ICE candidate.
///
/// `base` is the local transport address a candidate sends from, for
/// remote candidates it is the same as `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: String,
    pub component: u16,
    pub transport: Transport,
    pub priority: u32,
    pub address: SocketAddr,
    pub kind: CandidateKind,
    pub related: Option<SocketAddr>,
    pub base: SocketAddr,
}

impl Candidate {
    pub fn host(address: SocketAddr, component: u16) -> Self {
        Self::local(CandidateKind::Host, address, address, component)
    }

    /// advertise `address` while sending from `base`, for a host behind a
    /// static address mapping.
    pub fn with_base(mut self, base: SocketAddr) -> Self {
        self.base = base;
        self
    }

    /// a server-reflexive candidate learned through a STUN server from
    /// the host candidate `base`.
    pub fn server_reflexive(address: SocketAddr, base: SocketAddr, component: u16) -> Self {
        let mut it = Self::local(CandidateKind::ServerReflexive, address, base, component);
        it.related = Some(base);
        it
    }

    /// a remote candidate learned from the source address of a check.
    pub fn peer_reflexive(address: SocketAddr, priority: u32, component: u16) -> Self {
        Self {
            foundation: foundation(CandidateKind::PeerReflexive, address.ip()),
            kind: CandidateKind::PeerReflexive,
            transport: Transport::Udp,
            base: address,
            related: None,
            component,
            priority,
            address,
        }
    }

    fn local(kind: CandidateKind, address: SocketAddr, base: SocketAddr, component: u16) -> Self {
        Self {
            foundation: foundation(kind, base.ip()),
            priority: priority(kind, 65535, component),
            transport: Transport::Udp,
            related: None,
            component,
            address,
            kind,
            base,
        }
    }

    /// parse a candidate attribute, with or without the `a=` prefix.
    ///
    /// # Test
    ///
    /// ```
    /// use restream_service::ice::candidate::*;
    ///
    /// let candidate = Candidate::parse(
    ///     "a=candidate:842163049 1 udp 1677729535 203.0.113.7 61764 typ srflx raddr 192.168.1.2 rport 61764 generation 0",
    /// )
    /// .unwrap();
    ///
    /// assert_eq!(candidate.foundation, "842163049");
    /// assert_eq!(candidate.component, 1);
    /// assert_eq!(candidate.transport, Transport::Udp);
    /// assert_eq!(candidate.priority, 1677729535);
    /// assert_eq!(candidate.address, "203.0.113.7:61764".parse().unwrap());
    /// assert_eq!(candidate.kind, CandidateKind::ServerReflexive);
    /// assert_eq!(candidate.related, Some("192.168.1.2:61764".parse().unwrap()));
    ///
    /// assert!(Candidate::parse("candidate:1 1 udp 1 host.local 9 typ host").is_err());
    /// assert!(Candidate::parse("candidate:1 1 udp 1 10.0.0.1 9 host").is_err());
    /// ```
    pub fn parse(line: &str) -> Result<Self, Error> {
        let line = line.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let content = line
            .strip_prefix("candidate:")
            .ok_or(Error::InvalidCandidate)?;

        let parts: Vec<&str> = content.split_whitespace().collect();
        if parts.len() < 8 || parts[6] != "typ" {
            return Err(Error::InvalidCandidate);
        }

        let transport = match parts[2].to_ascii_lowercase().as_str() {
            "udp" => Transport::Udp,
            "tcp" => Transport::Tcp,
            _ => return Err(Error::InvalidCandidate),
        };

        let ip: IpAddr = parts[4].parse().map_err(|_| Error::InvalidCandidate)?;
        let port: u16 = parts[5].parse().map_err(|_| Error::InvalidCandidate)?;
        let address = SocketAddr::new(ip, port);

        let mut raddr = None;
        let mut rport = None;
        let mut index = 8;
        while index + 1 < parts.len() {
            match parts[index] {
                "raddr" => raddr = parts[index + 1].parse::<IpAddr>().ok(),
                "rport" => rport = parts[index + 1].parse::<u16>().ok(),
                _ => (),
            }

            index += 2;
        }

        Ok(Self {
            foundation: parts[0].to_string(),
            component: parts[1].parse().map_err(|_| Error::InvalidCandidate)?,
            priority: parts[3].parse().map_err(|_| Error::InvalidCandidate)?,
            kind: parts[7].parse()?,
            related: raddr.zip(rport).map(|(ip, port)| SocketAddr::new(ip, port)),
            base: address,
            transport,
            address,
        })
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            match self.transport {
                Transport::Udp => "udp",
                Transport::Tcp => "tcp",
            },
            self.priority,
            self.address.ip(),
            self.address.port(),
            self.kind.as_str(),
        )?;

        if let Some(related) = self.related {
            write!(f, " raddr {} rport {}", related.ip(), related.port())?;
        }

        Ok(())
    }
}

/// candidates of the same type sharing a base share a foundation.
fn foundation(kind: CandidateKind, base: IpAddr) -> String {
    let octets = match base {
        IpAddr::V4(ip) => ip.to_ipv6_mapped().octets(),
        IpAddr::V6(ip) => ip.octets(),
    };

    crc32c(&[&[kind.preference() as u8], &octets]).to_string()
}

/// Short-term credentials of one side of an ICE session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    /// random credentials, 8 ice-chars of ufrag and 24 ice-chars of
    /// password.
    ///
    /// # Test
    ///
    /// ```
    /// use restream_service::ice::candidate::IceCredentials;
    ///
    /// let credentials = IceCredentials::generate();
    /// assert_eq!(credentials.ufrag.len(), 8);
    /// assert_eq!(credentials.pwd.len(), 24);
    /// assert_ne!(credentials, IceCredentials::generate());
    /// ```
    pub fn generate() -> Self {
        let mut ufrag = [0u8; 6];
        let mut pwd = [0u8; 18];

        let mut rng = rand::rng();
        rng.fill(&mut ufrag);
        rng.fill(&mut pwd);

        Self {
            ufrag: BASE64_STANDARD_NO_PAD.encode(ufrag),
            pwd: BASE64_STANDARD_NO_PAD.encode(pwd),
        }
    }
}
