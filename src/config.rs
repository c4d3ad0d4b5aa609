use std::{fs::read_to_string, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use service::{
    dtls::DtlsOptions,
    ice::IceOptions,
    peer::PeerOptions,
    sctp::SctpOptions,
};

/// A peer-facing UDP interface.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Interface {
    ///
    /// The address the socket is bound to.
    ///
    pub listen: SocketAddr,
    ///
    /// external address
    ///
    /// specify the node external address and port.
    /// for the case of exposing the service to the outside,
    /// you need to manually specify the server external IP
    /// address and service listening port. It is advertised to the
    /// browser as a host candidate.
    ///
    pub external: SocketAddr,
}

impl From<Interface> for service::Interface {
    fn from(value: Interface) -> Self {
        Self {
            listen: value.listen,
            external: value.external,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    ///
    /// upstream listen
    ///
    /// The address the RTP producer sends the plain RTP feed to.
    ///
    #[serde(default = "Server::upstream")]
    pub upstream: SocketAddr,
    ///
    /// Maximum Transmission Unit (MTU) size for network packets.
    ///
    #[serde(default = "Server::mtu")]
    pub mtu: usize,
    ///
    /// Maximum number of threads the runtime can use.
    ///
    #[serde(default = "Server::max_threads")]
    pub max_threads: usize,
    ///
    /// peer listen interfaces
    ///
    /// The addresses and ports to which the peer-facing UDP sockets are
    /// bound. Multiple interfaces can be bound at the same time, every one
    /// of them is offered to each browser as a host candidate.
    ///
    #[serde(default)]
    pub interfaces: Vec<Interface>,
}

impl Server {
    fn upstream() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], 5004))
    }

    fn mtu() -> usize {
        1500
    }

    fn max_threads() -> usize {
        num_cpus::get()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            upstream: Self::upstream(),
            mtu: Self::mtu(),
            max_threads: Self::max_threads(),
            interfaces: Default::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Ice {
    ///
    /// STUN server used to gather server-reflexive candidates, only host
    /// candidates are offered when it is not set.
    ///
    #[serde(default)]
    pub stun_server: Option<SocketAddr>,
    ///
    /// Seconds without a nominated pair before the connection fails.
    ///
    #[serde(default = "Ice::gathering_timeout")]
    pub gathering_timeout: u64,
    ///
    /// Milliseconds between two connectivity checks.
    ///
    #[serde(default = "Ice::check_interval")]
    pub check_interval: u64,
    #[serde(default = "Ice::max_retransmits")]
    pub max_retransmits: u32,
    ///
    /// Seconds between two consent freshness checks.
    ///
    #[serde(default = "Ice::consent_interval")]
    pub consent_interval: u64,
    ///
    /// Seconds without a consent response before the connection fails.
    ///
    #[serde(default = "Ice::consent_timeout")]
    pub consent_timeout: u64,
}

impl Ice {
    fn gathering_timeout() -> u64 {
        30
    }

    fn check_interval() -> u64 {
        50
    }

    fn max_retransmits() -> u32 {
        7
    }

    fn consent_interval() -> u64 {
        5
    }

    fn consent_timeout() -> u64 {
        30
    }
}

impl Default for Ice {
    fn default() -> Self {
        Self {
            stun_server: None,
            gathering_timeout: Self::gathering_timeout(),
            check_interval: Self::check_interval(),
            max_retransmits: Self::max_retransmits(),
            consent_interval: Self::consent_interval(),
            consent_timeout: Self::consent_timeout(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Dtls {
    ///
    /// Milliseconds before the first retransmission of a handshake flight,
    /// doubled on every retry.
    ///
    #[serde(default = "Dtls::flight_timeout")]
    pub flight_timeout: u64,
    ///
    /// Retransmissions of one flight before the handshake gives up.
    ///
    #[serde(default = "Dtls::max_flights")]
    pub max_flights: u32,
}

impl Dtls {
    fn flight_timeout() -> u64 {
        1000
    }

    fn max_flights() -> u32 {
        6
    }
}

impl Default for Dtls {
    fn default() -> Self {
        Self {
            flight_timeout: Self::flight_timeout(),
            max_flights: Self::max_flights(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Sctp {
    ///
    /// Data channels are only negotiated when enabled.
    ///
    #[serde(default = "Sctp::enabled")]
    pub enabled: bool,
    #[serde(default = "Sctp::port")]
    pub port: u16,
    #[serde(default = "Sctp::max_message_size")]
    pub max_message_size: usize,
}

impl Sctp {
    fn enabled() -> bool {
        true
    }

    fn port() -> u16 {
        5000
    }

    fn max_message_size() -> usize {
        256 * 1024
    }
}

impl Default for Sctp {
    fn default() -> Self {
        Self {
            enabled: Self::enabled(),
            port: Self::port(),
            max_message_size: Self::max_message_size(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Pool {
    ///
    /// Number of packet buffers shared by all peer connections.
    ///
    #[serde(default = "Pool::buffers")]
    pub buffers: usize,
    #[serde(default = "Pool::buffer_size")]
    pub buffer_size: usize,
}

impl Pool {
    fn buffers() -> usize {
        4096
    }

    fn buffer_size() -> usize {
        1500
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self {
            buffers: Self::buffers(),
            buffer_size: Self::buffer_size(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub ice: Ice,
    #[serde(default)]
    pub dtls: Dtls,
    #[serde(default)]
    pub sctp: Sctp,
    #[serde(default)]
    pub pool: Pool,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: rtp-restream --config /etc/rtp-restream/config.json5
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters, if the configuration file path is specified,
    /// the configuration is read from the configuration file, otherwise the
    /// default configuration is used.
    ///
    pub fn load() -> Result<Self> {
        Ok(if let Some(path) = Cli::parse().config {
            Self::parse(&read_to_string(path)?)?
        } else {
            Self::default()
        })
    }

    /// Parse a JSON5 configuration document.
    ///
    /// # Test
    ///
    /// ```
    /// use rtp_restream::config::{Config, LogLevel};
    ///
    /// let config = Config::parse(
    ///     r#"{
    ///         server: {
    ///             upstream: "127.0.0.1:6004",
    ///             interfaces: [{ listen: "0.0.0.0:5000", external: "203.0.113.7:5000" }],
    ///         },
    ///         sctp: { enabled: false },
    ///         log: { level: "debug" },
    ///     }"#,
    /// )
    /// .unwrap();
    ///
    /// assert_eq!(config.server.upstream.port(), 6004);
    /// assert_eq!(config.server.mtu, 1500);
    /// assert_eq!(config.server.interfaces[0].external.port(), 5000);
    /// assert_eq!(config.ice.check_interval, 50);
    /// assert!(!config.sctp.enabled);
    /// assert_eq!(config.log.level, LogLevel::Debug);
    /// ```
    pub fn parse(document: &str) -> Result<Self> {
        Ok(serde_json5::from_str::<Self>(document)?)
    }

    pub fn interfaces(&self) -> Vec<service::Interface> {
        self.server
            .interfaces
            .iter()
            .map(|it| (*it).into())
            .collect()
    }

    /// Options every peer connection is created with.
    pub fn peer_options(&self) -> PeerOptions {
        PeerOptions {
            ice: IceOptions {
                check_interval: Duration::from_millis(self.ice.check_interval),
                max_retransmits: self.ice.max_retransmits,
                consent_interval: Duration::from_secs(self.ice.consent_interval),
                consent_timeout: Duration::from_secs(self.ice.consent_timeout),
                gathering_timeout: Duration::from_secs(self.ice.gathering_timeout),
                stun_server: self.ice.stun_server,
                ..Default::default()
            },
            dtls: DtlsOptions {
                flight_timeout: Duration::from_millis(self.dtls.flight_timeout),
                max_flights: self.dtls.max_flights,
                ..Default::default()
            },
            sctp: self.sctp.enabled.then(|| SctpOptions {
                port: self.sctp.port,
                max_message_size: self.sctp.max_message_size,
                ..Default::default()
            }),
        }
    }
}
