use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};

use super::cause::ErrorCause;
use crate::{Error, alignment_32, padded};

/// Chunk types.
///
/// [RFC4960]: https://datatracker.ietf.org/doc/html/rfc4960#section-3.2
///
/// ID Value    Chunk Type
/// -----       ----------
/// 0          - Payload Data (DATA)
/// 1          - Initiation (INIT)
/// 2          - Initiation Acknowledgement (INIT ACK)
/// 3          - Selective Acknowledgement (SACK)
/// 4          - Heartbeat Request (HEARTBEAT)
/// 5          - Heartbeat Acknowledgement (HEARTBEAT ACK)
/// 6          - Abort (ABORT)
/// 7          - Shutdown (SHUTDOWN)
/// 8          - Shutdown Acknowledgement (SHUTDOWN ACK)
/// 9          - Operation Error (ERROR)
/// 10         - State Cookie (COOKIE ECHO)
/// 11         - Cookie Acknowledgement (COOKIE ACK)
/// 14         - Shutdown Complete (SHUTDOWN COMPLETE)
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, FromPrimitive, IntoPrimitive)]
pub enum ChunkType {
    Data = 0,
    Init = 1,
    InitAck = 2,
    Sack = 3,
    Heartbeat = 4,
    HeartbeatAck = 5,
    Abort = 6,
    Shutdown = 7,
    ShutdownAck = 8,
    Error = 9,
    CookieEcho = 10,
    CookieAck = 11,
    ShutdownComplete = 14,
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// What the receiver does with a chunk type it does not understand,
/// encoded in the highest-order 2 bits of the Chunk Type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnrecognizedAction {
    /// 00 - Stop processing this SCTP packet and discard it.
    Discard,
    /// 01 - Stop processing and discard, report in an ERROR chunk.
    DiscardAndReport,
    /// 10 - Skip this chunk and continue processing.
    Skip,
    /// 11 - Skip this chunk and continue processing, report in an ERROR
    /// chunk.
    SkipAndReport,
}

impl UnrecognizedAction {
    /// # Test
    ///
    /// ```
    /// use restream_codec::sctp::chunk::UnrecognizedAction;
    ///
    /// assert_eq!(UnrecognizedAction::from_type(0x3f), UnrecognizedAction::Discard);
    /// assert_eq!(UnrecognizedAction::from_type(0x40), UnrecognizedAction::DiscardAndReport);
    /// assert_eq!(UnrecognizedAction::from_type(0x80), UnrecognizedAction::Skip);
    /// assert_eq!(UnrecognizedAction::from_type(0xc0), UnrecognizedAction::SkipAndReport);
    /// ```
    pub fn from_type(kind: u8) -> Self {
        match kind >> 6 {
            0 => Self::Discard,
            1 => Self::DiscardAndReport,
            2 => Self::Skip,
            _ => Self::SkipAndReport,
        }
    }

    pub fn should_report(self) -> bool {
        matches!(self, Self::DiscardAndReport | Self::SkipAndReport)
    }

    pub fn should_skip(self) -> bool {
        matches!(self, Self::Skip | Self::SkipAndReport)
    }
}

/// Variable-length parameter carried by INIT and INIT ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub kind: u16,
    pub value: Bytes,
}

impl Parameter {
    pub const HEARTBEAT_INFO: u16 = 1;
    pub const STATE_COOKIE: u16 = 7;
    pub const UNRECOGNIZED_PARAMETER: u16 = 8;
    pub const SUPPORTED_EXTENSIONS: u16 = 0x8008;
    pub const FORWARD_TSN_SUPPORTED: u16 = 0xC000;

    pub fn new(kind: u16, value: Bytes) -> Self {
        Self { kind, value }
    }

    pub fn semantic_len(&self) -> usize {
        4 + self.value.len()
    }

    fn write_to(&self, bytes: &mut BytesMut) {
        bytes.put_u16(self.kind);
        bytes.put_u16(self.semantic_len() as u16);
        bytes.put(&self.value[..]);
        put_padding(bytes, self.semantic_len());
    }

    /// Whole parameter as it appeared on the wire, without padding.
    pub fn to_bytes(&self) -> Bytes {
        let mut bytes = BytesMut::with_capacity(padded(self.semantic_len()));
        self.write_to(&mut bytes);
        bytes.truncate(self.semantic_len());
        bytes.freeze()
    }

    fn decode_all(mut bytes: Bytes) -> Result<Vec<Self>, Error> {
        let mut parameters = Vec::new();
        while !bytes.is_empty() {
            if bytes.len() < 4 {
                return Err(Error::ProtocolViolation("truncated parameter"));
            }

            let kind = u16::from_be_bytes([bytes[0], bytes[1]]);
            let size = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
            if size < 4 || size > bytes.len() {
                return Err(Error::ProtocolViolation("invalid parameter length"));
            }

            parameters.push(Self {
                value: bytes.slice(4..size),
                kind,
            });

            bytes.advance(padded(size).min(bytes.len()));
        }

        Ok(parameters)
    }
}

/// Payload Data (DATA) (0)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   Type = 0    | Reserved|U|B|E|    Length                     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                              TSN                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      Stream Identifier S      |   Stream Sequence Number n    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                  Payload Protocol Identifier                  |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// \                                                               \
/// /                 User Data (seq n of Stream S)                 /
/// \                                                               \
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    /// The (U)nordered bit, if set to '1', indicates that this is an
    /// unordered DATA chunk.
    pub unordered: bool,
    /// The (B)eginning fragment bit, if set, indicates the first fragment
    /// of a user message.
    pub beginning: bool,
    /// The (E)nding fragment bit, if set, indicates the last fragment of
    /// a user message.
    pub ending: bool,
    pub tsn: u32,
    pub stream: u16,
    pub ssn: u16,
    pub ppid: u32,
    pub payload: Bytes,
}

const DATA_ENDING: u8 = 0b0001;
const DATA_BEGINNING: u8 = 0b0010;
const DATA_UNORDERED: u8 = 0b0100;

/// Initiation (INIT) (1) and Initiation Acknowledgement (INIT ACK) (2)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   Type = 1    |  Chunk Flags  |      Chunk Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                         Initiate Tag                          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           Advertised Receiver Window Credit (a_rwnd)          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Number of Outbound Streams   |  Number of Inbound Streams    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Initial TSN                          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// \                                                               \
/// /              Optional/Variable-Length Parameters              /
/// \                                                               \
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Init {
    pub initiate_tag: u32,
    pub a_rwnd: u32,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    pub initial_tsn: u32,
    pub parameters: Vec<Parameter>,
}

impl Init {
    pub fn parameter(&self, kind: u16) -> Option<&Parameter> {
        self.parameters.iter().find(|it| it.kind == kind)
    }
}

/// Selective Acknowledgement (SACK) (3)
///
/// Gap Ack Blocks are offsets relative to the Cumulative TSN Ack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sack {
    pub cumulative_tsn: u32,
    pub a_rwnd: u32,
    pub gap_blocks: Vec<(u16, u16)>,
    pub duplicates: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Data),
    Init(Init),
    InitAck(Init),
    Sack(Sack),
    /// Heartbeat Information TLV, echoed back unchanged.
    Heartbeat(Bytes),
    HeartbeatAck(Bytes),
    /// The T bit is set when the sender filled in the Verification Tag
    /// expected by the peer instead of its own.
    Abort {
        reflected: bool,
        causes: Vec<ErrorCause>,
    },
    Shutdown {
        cumulative_tsn: u32,
    },
    ShutdownAck,
    Error {
        causes: Vec<ErrorCause>,
    },
    CookieEcho(Bytes),
    CookieAck,
    ShutdownComplete {
        reflected: bool,
    },
    Unknown {
        kind: u8,
        flags: u8,
        value: Bytes,
    },
}

impl Chunk {
    pub fn kind(&self) -> ChunkType {
        match self {
            Self::Data(_) => ChunkType::Data,
            Self::Init(_) => ChunkType::Init,
            Self::InitAck(_) => ChunkType::InitAck,
            Self::Sack(_) => ChunkType::Sack,
            Self::Heartbeat(_) => ChunkType::Heartbeat,
            Self::HeartbeatAck(_) => ChunkType::HeartbeatAck,
            Self::Abort { .. } => ChunkType::Abort,
            Self::Shutdown { .. } => ChunkType::Shutdown,
            Self::ShutdownAck => ChunkType::ShutdownAck,
            Self::Error { .. } => ChunkType::Error,
            Self::CookieEcho(_) => ChunkType::CookieEcho,
            Self::CookieAck => ChunkType::CookieAck,
            Self::ShutdownComplete { .. } => ChunkType::ShutdownComplete,
            Self::Unknown { kind, .. } => ChunkType::from(*kind),
        }
    }

    fn flags(&self) -> u8 {
        match self {
            Self::Data(data) => {
                let mut flags = 0;
                if data.ending {
                    flags |= DATA_ENDING;
                }

                if data.beginning {
                    flags |= DATA_BEGINNING;
                }

                if data.unordered {
                    flags |= DATA_UNORDERED;
                }

                flags
            }
            Self::Abort { reflected, .. } | Self::ShutdownComplete { reflected } => *reflected as u8,
            Self::Unknown { flags, .. } => *flags,
            _ => 0,
        }
    }

    fn value_len(&self) -> usize {
        match self {
            Self::Data(data) => 12 + data.payload.len(),
            Self::Init(init) | Self::InitAck(init) => {
                // every parameter but the last one is padded.
                let size: usize = init.parameters.iter().map(|it| padded(it.semantic_len())).sum();
                let tail = init
                    .parameters
                    .last()
                    .map(|it| alignment_32(it.semantic_len()))
                    .unwrap_or(0);

                16 + size - tail
            }
            Self::Sack(sack) => 12 + sack.gap_blocks.len() * 4 + sack.duplicates.len() * 4,
            Self::Heartbeat(info) | Self::HeartbeatAck(info) | Self::CookieEcho(info) => info.len(),
            Self::Abort { causes, .. } | Self::Error { causes } => {
                let size: usize = causes.iter().map(|it| it.wire_len()).sum();
                let tail = causes
                    .last()
                    .map(|it| it.wire_len() - it.semantic_len())
                    .unwrap_or(0);

                size - tail
            }
            Self::Shutdown { .. } => 4,
            Self::Unknown { value, .. } => value.len(),
            Self::ShutdownAck | Self::CookieAck | Self::ShutdownComplete { .. } => 0,
        }
    }

    /// the Chunk Length field, header included and trailing padding
    /// excluded.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::Bytes;
    /// use restream_codec::sctp::chunk::{Chunk, Data};
    ///
    /// let chunk = Chunk::Data(Data {
    ///     unordered: false,
    ///     beginning: true,
    ///     ending: true,
    ///     tsn: 1,
    ///     stream: 0,
    ///     ssn: 0,
    ///     ppid: 51,
    ///     payload: Bytes::from_static(b"hello"),
    /// });
    ///
    /// assert_eq!(chunk.semantic_len(), 21);
    /// assert_eq!(chunk.wire_len(), 24);
    /// ```
    pub fn semantic_len(&self) -> usize {
        4 + self.value_len()
    }

    pub fn wire_len(&self) -> usize {
        padded(self.semantic_len())
    }

    pub fn write_to(&self, bytes: &mut BytesMut) {
        bytes.put_u8(self.kind().into());
        bytes.put_u8(self.flags());
        bytes.put_u16(self.semantic_len() as u16);

        match self {
            Self::Data(data) => {
                bytes.put_u32(data.tsn);
                bytes.put_u16(data.stream);
                bytes.put_u16(data.ssn);
                bytes.put_u32(data.ppid);
                bytes.put(&data.payload[..]);
            }
            Self::Init(init) | Self::InitAck(init) => {
                bytes.put_u32(init.initiate_tag);
                bytes.put_u32(init.a_rwnd);
                bytes.put_u16(init.outbound_streams);
                bytes.put_u16(init.inbound_streams);
                bytes.put_u32(init.initial_tsn);

                let start = bytes.len();
                for parameter in &init.parameters {
                    parameter.write_to(bytes);
                }

                // the trailing padding is written once below.
                let end = start + self.value_len() - 16;
                bytes.truncate(end);
            }
            Self::Sack(sack) => {
                bytes.put_u32(sack.cumulative_tsn);
                bytes.put_u32(sack.a_rwnd);
                bytes.put_u16(sack.gap_blocks.len() as u16);
                bytes.put_u16(sack.duplicates.len() as u16);

                for (start, end) in &sack.gap_blocks {
                    bytes.put_u16(*start);
                    bytes.put_u16(*end);
                }

                for tsn in &sack.duplicates {
                    bytes.put_u32(*tsn);
                }
            }
            Self::Heartbeat(info) | Self::HeartbeatAck(info) | Self::CookieEcho(info) => {
                bytes.put(&info[..]);
            }
            Self::Abort { causes, .. } | Self::Error { causes } => {
                let start = bytes.len();
                for cause in causes {
                    cause.write_to(bytes);
                }

                bytes.truncate(start + self.value_len());
            }
            Self::Shutdown { cumulative_tsn } => bytes.put_u32(*cumulative_tsn),
            Self::Unknown { value, .. } => bytes.put(&value[..]),
            Self::ShutdownAck | Self::CookieAck | Self::ShutdownComplete { .. } => (),
        }

        put_padding(bytes, self.semantic_len());
    }

    /// The whole chunk without trailing padding, as reported back in an
    /// Unrecognized Chunk Type error cause.
    pub fn to_bytes(&self) -> Bytes {
        let mut bytes = BytesMut::with_capacity(self.wire_len());
        self.write_to(&mut bytes);
        bytes.truncate(self.semantic_len());
        bytes.freeze()
    }

    /// decode one chunk from the front of `bytes`, returns the chunk and
    /// the number of bytes it occupied including padding.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::Bytes;
    /// use restream_codec::sctp::chunk::Chunk;
    ///
    /// let buffer = Bytes::from_static(&[0x0b, 0x00, 0x00, 0x04]);
    /// let (chunk, size) = Chunk::decode(&buffer).unwrap();
    /// assert_eq!(chunk, Chunk::CookieAck);
    /// assert_eq!(size, 4);
    ///
    /// let buffer = Bytes::from_static(&[0x0b, 0x00, 0x00, 0x00]);
    /// assert!(Chunk::decode(&buffer).is_err());
    /// ```
    pub fn decode(bytes: &Bytes) -> Result<(Self, usize), Error> {
        if bytes.len() < 4 {
            return Err(Error::ProtocolViolation("truncated chunk header"));
        }

        let kind = bytes[0];
        let flags = bytes[1];
        let size = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if size < 4 {
            return Err(Error::ProtocolViolation("chunk length below header size"));
        }

        if size > bytes.len() {
            return Err(Error::ProtocolViolation("chunk length exceeds packet"));
        }

        let mut value = bytes.slice(4..size);
        let chunk = match ChunkType::from(kind) {
            ChunkType::Data => {
                if value.len() < 12 {
                    return Err(Error::ProtocolViolation("data chunk too short"));
                }

                Self::Data(Data {
                    unordered: flags & DATA_UNORDERED != 0,
                    beginning: flags & DATA_BEGINNING != 0,
                    ending: flags & DATA_ENDING != 0,
                    tsn: value.get_u32(),
                    stream: value.get_u16(),
                    ssn: value.get_u16(),
                    ppid: value.get_u32(),
                    payload: value,
                })
            }
            ChunkType::Init | ChunkType::InitAck => {
                if value.len() < 16 {
                    return Err(Error::ProtocolViolation("init chunk too short"));
                }

                let init = Init {
                    initiate_tag: value.get_u32(),
                    a_rwnd: value.get_u32(),
                    outbound_streams: value.get_u16(),
                    inbound_streams: value.get_u16(),
                    initial_tsn: value.get_u32(),
                    parameters: Parameter::decode_all(value)?,
                };

                if kind == u8::from(ChunkType::Init) {
                    Self::Init(init)
                } else {
                    Self::InitAck(init)
                }
            }
            ChunkType::Sack => {
                if value.len() < 12 {
                    return Err(Error::ProtocolViolation("sack chunk too short"));
                }

                let cumulative_tsn = value.get_u32();
                let a_rwnd = value.get_u32();
                let gaps = value.get_u16() as usize;
                let dups = value.get_u16() as usize;
                if value.len() != gaps * 4 + dups * 4 {
                    return Err(Error::ProtocolViolation("sack block count mismatch"));
                }

                Self::Sack(Sack {
                    gap_blocks: (0..gaps).map(|_| (value.get_u16(), value.get_u16())).collect(),
                    duplicates: (0..dups).map(|_| value.get_u32()).collect(),
                    cumulative_tsn,
                    a_rwnd,
                })
            }
            ChunkType::Heartbeat => Self::Heartbeat(value),
            ChunkType::HeartbeatAck => Self::HeartbeatAck(value),
            ChunkType::Abort => Self::Abort {
                reflected: flags & 1 != 0,
                causes: ErrorCause::decode_all(value)?,
            },
            ChunkType::Shutdown => {
                if value.len() != 4 {
                    return Err(Error::ProtocolViolation("invalid shutdown chunk length"));
                }

                Self::Shutdown {
                    cumulative_tsn: value.get_u32(),
                }
            }
            ChunkType::ShutdownAck => Self::ShutdownAck,
            ChunkType::Error => Self::Error {
                causes: ErrorCause::decode_all(value)?,
            },
            ChunkType::CookieEcho => Self::CookieEcho(value),
            ChunkType::CookieAck => Self::CookieAck,
            ChunkType::ShutdownComplete => Self::ShutdownComplete {
                reflected: flags & 1 != 0,
            },
            ChunkType::Unknown(kind) => Self::Unknown { kind, flags, value },
        };

        Ok((chunk, padded(size).min(bytes.len())))
    }
}

fn put_padding(bytes: &mut BytesMut, size: usize) {
    let psize = alignment_32(size);
    if psize > 0 {
        bytes.put(&[0u8; 3][..psize]);
    }
}
