use crate::Error;

/// STUN Methods Registry
///
/// [RFC8489]: https://datatracker.ietf.org/doc/html/rfc8489
/// [RFC8656]: https://datatracker.ietf.org/doc/html/rfc8656
///
/// A STUN method is a hex number in the range 0x000-0xFFF.  Only Binding
/// is used by ICE, the remaining methods are the TURN [RFC8656] extensions
/// that share the same message layout.
///
/// 0x000: Reserved
/// 0x001: Binding
/// 0x002: Reserved; was SharedSecret prior to [RFC5389]
/// 0x003: Allocate
/// 0x004: Refresh
/// 0x006: Send
/// 0x007: Data
/// 0x008: CreatePermission
/// 0x009: ChannelBind
///
/// Any other method number is carried as [`Method::Unknown`].
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum Method {
    Binding,
    Allocate,
    Refresh,
    Send,
    Data,
    CreatePermission,
    ChannelBind,
    Unknown(u16),
}

impl From<u16> for Method {
    #[rustfmt::skip]
    fn from(value: u16) -> Self {
        match value {
            0x001 => Self::Binding,
            0x003 => Self::Allocate,
            0x004 => Self::Refresh,
            0x006 => Self::Send,
            0x007 => Self::Data,
            0x008 => Self::CreatePermission,
            0x009 => Self::ChannelBind,
            other => Self::Unknown(other & 0x0FFF),
        }
    }
}

impl From<Method> for u16 {
    #[rustfmt::skip]
    fn from(value: Method) -> Self {
        match value {
            Method::Binding          => 0x001,
            Method::Allocate         => 0x003,
            Method::Refresh          => 0x004,
            Method::Send             => 0x006,
            Method::Data             => 0x007,
            Method::CreatePermission => 0x008,
            Method::ChannelBind      => 0x009,
            Method::Unknown(code)    => code & 0x0FFF,
        }
    }
}

/// The message class is encoded in two bits spread over the message
/// type, C1 at bit 8 and C0 at bit 4:
///
/// ```text
///  0                 1
///  2  3  4 5 6 7 8 9 0 1 2 3 4 5
/// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
/// |M |M |M|M|M|C|M|M|M|C|M|M|M|M|
/// |11|10|9|8|7|1|6|5|4|0|3|2|1|0|
/// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// A class of 0b00 is a request, 0b01 is an indication, 0b10 is a
/// success response, and 0b11 is an error response.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

static CLASSES: [MessageClass; 4] = [
    MessageClass::Request,
    MessageClass::Indication,
    MessageClass::SuccessResponse,
    MessageClass::ErrorResponse,
];

impl MessageClass {
    fn bits(self) -> u16 {
        match self {
            Self::Request => 0b00,
            Self::Indication => 0b01,
            Self::SuccessResponse => 0b10,
            Self::ErrorResponse => 0b11,
        }
    }

    pub fn is_response(self) -> bool {
        matches!(self, Self::SuccessResponse | Self::ErrorResponse)
    }
}

#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub struct MessageType {
    pub method: Method,
    pub class: MessageClass,
}

pub const BINDING_REQUEST: MessageType = MessageType::new(Method::Binding, MessageClass::Request);
pub const BINDING_INDICATION: MessageType =
    MessageType::new(Method::Binding, MessageClass::Indication);
pub const BINDING_RESPONSE: MessageType =
    MessageType::new(Method::Binding, MessageClass::SuccessResponse);
pub const BINDING_ERROR: MessageType =
    MessageType::new(Method::Binding, MessageClass::ErrorResponse);

impl MessageType {
    pub const fn new(method: Method, class: MessageClass) -> Self {
        Self { method, class }
    }

    /// the error response type answering a request of this method.
    pub fn error(&self) -> Self {
        Self::new(self.method, MessageClass::ErrorResponse)
    }

    /// the success response type answering a request of this method.
    pub fn response(&self) -> Self {
        Self::new(self.method, MessageClass::SuccessResponse)
    }
}

impl TryFrom<u16> for MessageType {
    type Error = Error;

    /// # Test
    ///
    /// ```
    /// use restream_codec::stun::methods::*;
    /// use restream_codec::Error;
    ///
    /// assert_eq!(MessageType::try_from(0x0001).unwrap(), BINDING_REQUEST);
    /// assert_eq!(MessageType::try_from(0x0011).unwrap(), BINDING_INDICATION);
    /// assert_eq!(MessageType::try_from(0x0101).unwrap(), BINDING_RESPONSE);
    /// assert_eq!(MessageType::try_from(0x0111).unwrap(), BINDING_ERROR);
    ///
    /// let allocate = MessageType::try_from(0x0103).unwrap();
    /// assert_eq!(allocate.method, Method::Allocate);
    /// assert_eq!(allocate.class, MessageClass::SuccessResponse);
    ///
    /// let unknown = MessageType::try_from(0x0fef).unwrap();
    /// assert_eq!(unknown.method, Method::Unknown(0x03ff));
    ///
    /// assert_eq!(MessageType::try_from(0x4001), Err(Error::UnknownMessageType));
    /// ```
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        // the two most significant bits of every STUN message are zero.
        if value > 0x3FFF {
            return Err(Error::UnknownMessageType);
        }

        let method = (value & 0x000F) | ((value & 0x00E0) >> 1) | ((value & 0x3E00) >> 2);
        let class = ((value >> 7) & 0b10) | ((value >> 4) & 0b01);

        Ok(Self {
            method: Method::from(method),
            class: CLASSES[class as usize],
        })
    }
}

impl From<MessageType> for u16 {
    /// # Test
    ///
    /// ```
    /// use restream_codec::stun::methods::*;
    ///
    /// assert_eq!(u16::from(BINDING_REQUEST), 0x0001);
    /// assert_eq!(u16::from(BINDING_INDICATION), 0x0011);
    /// assert_eq!(u16::from(BINDING_RESPONSE), 0x0101);
    /// assert_eq!(u16::from(BINDING_ERROR), 0x0111);
    /// assert_eq!(
    ///     u16::from(MessageType::new(Method::ChannelBind, MessageClass::ErrorResponse)),
    ///     0x0119
    /// );
    /// ```
    fn from(value: MessageType) -> Self {
        let method = u16::from(value.method);
        let class = value.class.bits();

        ((method & 0x0F80) << 2)
            | ((method & 0x0070) << 1)
            | (method & 0x000F)
            | ((class & 0b10) << 7)
            | ((class & 0b01) << 4)
    }
}
