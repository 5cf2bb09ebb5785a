//! The error taxonomy shared by every fallible operation of the fabric.

use std::fmt;

/// Errors returned by the core.
///
/// Every code has a stable `i32` wire representation; `0` on the wire means
/// success and is represented as `Ok(..)` rather than a variant here.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Allocation failure.
    OutOfMemory = -1,
    /// An implementation panicked; the panic was caught at the stub boundary.
    Exception = -2,
    /// The requested protocol version is outside the supported band.
    InvalidVersion = -3,
    /// Version negotiation exhausted every version down to zero.
    IncompatibleService = -4,
    /// The payload encoding is not one the peer understands.
    IncompatibleSerialisation = -5,
    /// No channel toward the requested zone.
    ZoneNotFound = -6,
    /// The object id does not name a live stub.
    ObjectNotFound = -7,
    /// The interface ordinal does not name a dispatchable interface.
    InvalidInterfaceId = -8,
    /// The implementation does not support the requested interface.
    InvalidCast = -9,
    /// The caller side failed to decode a reply payload.
    ProxyDeserialisationError = -10,
    /// The callee side failed to decode a request payload.
    StubDeserialisationError = -11,
    /// Malformed wire data or an internal consistency failure.
    InvalidData = -12,
    /// The reference-count engine caught an invariant violation.
    ReferenceCountError = -13,
    /// The zone has not completed its bootstrap.
    ZoneNotInitialised = -14,
    /// The operation is not supported by this kind of zone.
    ZoneNotSupported = -15,
}

impl ErrorCode {
    /// The stable wire representation.
    pub fn to_wire(self) -> i32 {
        self as i32
    }

    /// Decode a wire code. `0` is success and has no `ErrorCode`; unknown
    /// codes collapse to [`ErrorCode::InvalidData`].
    pub fn from_wire(code: i32) -> Option<ErrorCode> {
        Some(match code {
            0 => return None,
            -1 => Self::OutOfMemory,
            -2 => Self::Exception,
            -3 => Self::InvalidVersion,
            -4 => Self::IncompatibleService,
            -5 => Self::IncompatibleSerialisation,
            -6 => Self::ZoneNotFound,
            -7 => Self::ObjectNotFound,
            -8 => Self::InvalidInterfaceId,
            -9 => Self::InvalidCast,
            -10 => Self::ProxyDeserialisationError,
            -11 => Self::StubDeserialisationError,
            -12 => Self::InvalidData,
            -13 => Self::ReferenceCountError,
            -14 => Self::ZoneNotInitialised,
            -15 => Self::ZoneNotSupported,
            _ => Self::InvalidData,
        })
    }

    /// Encode a result as a wire code.
    pub fn result_to_wire(result: &Result<(), ErrorCode>) -> i32 {
        match result {
            Ok(()) => 0,
            Err(e) => e.to_wire(),
        }
    }

    /// Decode a wire code as a result.
    pub fn wire_to_result(code: i32) -> Result<(), ErrorCode> {
        match Self::from_wire(code) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::OutOfMemory => "out of memory",
            Self::Exception => "implementation raised an exception",
            Self::InvalidVersion => "protocol version outside the supported band",
            Self::IncompatibleService => "no protocol version in common with the peer",
            Self::IncompatibleSerialisation => "payload encoding not understood",
            Self::ZoneNotFound => "no route to the requested zone",
            Self::ObjectNotFound => "object not found",
            Self::InvalidInterfaceId => "unknown interface ordinal",
            Self::InvalidCast => "interface not supported by the implementation",
            Self::ProxyDeserialisationError => "reply payload could not be decoded",
            Self::StubDeserialisationError => "request payload could not be decoded",
            Self::InvalidData => "malformed data",
            Self::ReferenceCountError => "reference count invariant violated",
            Self::ZoneNotInitialised => "zone not initialised",
            Self::ZoneNotSupported => "operation not supported by this zone",
        };
        f.write_str(text)
    }
}

impl std::error::Error for ErrorCode {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        for code in [
            ErrorCode::OutOfMemory,
            ErrorCode::Exception,
            ErrorCode::InvalidVersion,
            ErrorCode::IncompatibleService,
            ErrorCode::IncompatibleSerialisation,
            ErrorCode::ZoneNotFound,
            ErrorCode::ObjectNotFound,
            ErrorCode::InvalidInterfaceId,
            ErrorCode::InvalidCast,
            ErrorCode::ProxyDeserialisationError,
            ErrorCode::StubDeserialisationError,
            ErrorCode::InvalidData,
            ErrorCode::ReferenceCountError,
            ErrorCode::ZoneNotInitialised,
            ErrorCode::ZoneNotSupported,
        ] {
            assert_eq!(ErrorCode::from_wire(code.to_wire()), Some(code));
        }
    }

    #[test]
    fn zero_is_success() {
        assert_eq!(ErrorCode::from_wire(0), None);
        assert!(ErrorCode::wire_to_result(0).is_ok());
    }

    #[test]
    fn unknown_codes_collapse_to_invalid_data() {
        assert_eq!(ErrorCode::from_wire(-9999), Some(ErrorCode::InvalidData));
    }
}
