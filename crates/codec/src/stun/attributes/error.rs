use num_enum::TryFromPrimitive;

/// The following error codes, along with their recommended reason
/// phrases, are the ones an ICE agent answers with:
///
/// 400  Bad Request: The request was malformed.  The client SHOULD NOT
///      retry the request without modification from the previous
///      attempt.
///
/// 401  Unauthenticated: The request did not contain the correct
///      credentials to proceed.  The client should retry the request
///      with proper credentials.
///
/// 420  Unknown Attribute: The server received a STUN packet containing
///      a comprehension-required attribute that it did not understand.
///
/// 487  Role Conflict: The client asserted an ICE role (controlling or
///      controlled) that is in conflict with the role of the server.
///
/// 500  Server Error: The server has suffered a temporary error.  The
///      client should try again.
const fn errno(code: u16) -> u16 {
    ((code / 100) << 8) | (code % 100)
}

#[repr(u16)]
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash, TryFromPrimitive)]
pub enum ErrorType {
    TryAlternate = errno(300),
    BadRequest = errno(400),
    Unauthorized = errno(401),
    Forbidden = errno(403),
    UnknownAttribute = errno(420),
    StaleNonce = errno(438),
    RoleConflict = errno(487),
    ServerError = errno(500),
}

impl From<ErrorType> for &'static str {
    /// # Test
    ///
    /// ```
    /// use restream_codec::stun::attributes::error::ErrorType;
    ///
    /// let err: &'static str = ErrorType::RoleConflict.into();
    /// assert_eq!(err, "Role Conflict");
    /// ```
    #[rustfmt::skip]
    fn from(val: ErrorType) -> Self {
        match val {
            ErrorType::TryAlternate => "Try Alternate",
            ErrorType::BadRequest => "Bad Request",
            ErrorType::Unauthorized => "Unauthorized",
            ErrorType::Forbidden => "Forbidden",
            ErrorType::UnknownAttribute => "Unknown Attribute",
            ErrorType::StaleNonce => "Stale Nonce",
            ErrorType::RoleConflict => "Role Conflict",
            ErrorType::ServerError => "Server Error",
        }
    }
}

impl ErrorType {
    /// the numeric error code, e.g. `401`.
    pub fn code(self) -> u16 {
        let raw = self as u16;
        (raw >> 8) * 100 + (raw & 0xFF)
    }
}
