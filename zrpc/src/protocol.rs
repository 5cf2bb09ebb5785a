//! The wire model: encodings, build-route options, request and reply
//! records, and the byte-level codec.
//!
//! The core treats method payloads as opaque bytes; only the envelope fields
//! defined here have a meaning to the routing engine. The primitive
//! read/write helpers are public because generated interface code uses the
//! same routines to marshal its arguments.

use bitflags::bitflags;

use crate::error::ErrorCode;
use crate::types::{
    CallerChannelZoneId, CallerZoneId, DestinationChannelZoneId, DestinationZoneId,
    InterfaceDescriptor, InterfaceOrdinal, KnownDirectionZoneId, MethodId, ObjectId,
};

/// Payload encodings understood by the fabric.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Whatever the generated code picks; currently the same as `Binary`.
    #[default]
    Default = 0,
    /// Fixed-width binary.
    Binary = 1,
    /// Compressed binary.
    CompressedBinary = 2,
    /// Textual JSON.
    Json = 3,
}

impl Encoding {
    /// The wire byte.
    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// Decode a wire byte.
    pub fn from_wire(byte: u8) -> Result<Self, ErrorCode> {
        match byte {
            0 => Ok(Self::Default),
            1 => Ok(Self::Binary),
            2 => Ok(Self::CompressedBinary),
            3 => Ok(Self::Json),
            _ => Err(ErrorCode::IncompatibleSerialisation),
        }
    }
}

bitflags! {
    /// Build-route options carried by `add_ref`.
    ///
    /// An empty set is a plain reference bump on an already-wired object.
    /// The two build bits are the vocabulary of a fork: a zone that is
    /// neither caller nor destination receives a reference with both bits
    /// set and decides whether to pass it along one way (still transiting)
    /// or split it two ways.
    pub struct AddRefOptions: u8 {
        /// Wire up (or reuse) a channel toward the destination.
        const BUILD_DESTINATION_ROUTE = 0b0000_0001;
        /// Wire up a back-channel toward the caller so the destination zone
        /// can later return objects to it.
        const BUILD_CALLER_ROUTE = 0b0000_0010;
    }
}

impl AddRefOptions {
    /// A plain reference bump.
    pub const NORMAL: AddRefOptions = AddRefOptions::empty();

    /// Whether either build bit is set.
    pub fn builds_channel(self) -> bool {
        self.intersects(Self::BUILD_DESTINATION_ROUTE | Self::BUILD_CALLER_ROUTE)
    }
}

/// The reply value of `add_ref`/`release` when the peer rejected the
/// protocol version; distinct from any legal reference count.
pub const VERSION_MISMATCH_COUNT: u64 = u64::MAX;

/// The envelope of a method call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    /// Protocol version, always the first wire field.
    pub protocol_version: u64,
    /// Payload encoding.
    pub encoding: Encoding,
    /// Opaque routing tag, echoed to telemetry sinks.
    pub tag: u64,
    /// The hop the call arrived through, if the caller is not adjacent.
    pub caller_channel_zone_id: CallerChannelZoneId,
    /// The zone the call originated from.
    pub caller_zone_id: CallerZoneId,
    /// The zone the call is destined for.
    pub destination_zone_id: DestinationZoneId,
    /// The target object in the destination zone.
    pub object_id: ObjectId,
    /// The target interface.
    pub interface_id: InterfaceOrdinal,
    /// The target method.
    pub method_id: MethodId,
    /// The marshalled arguments.
    pub payload: Vec<u8>,
}

/// The envelope of a reference-count operation (`add_ref`, `release`) and of
/// `try_cast`, which shares the routing fields but has no count semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefRequest {
    /// Protocol version.
    pub protocol_version: u64,
    /// The hop toward the destination, if it is not adjacent.
    pub destination_channel_zone_id: DestinationChannelZoneId,
    /// The home zone of the object.
    pub destination_zone_id: DestinationZoneId,
    /// The object whose count is changing.
    pub object_id: ObjectId,
    /// The hop the request arrived through, if the caller is not adjacent.
    pub caller_channel_zone_id: CallerChannelZoneId,
    /// The zone on whose behalf the reference is held.
    pub caller_zone_id: CallerZoneId,
    /// Where the object was last seen; terminates routing in topologies the
    /// local zone has no direct channel for.
    pub known_direction_zone_id: KnownDirectionZoneId,
    /// Which side(s) of the route this hop should wire up.
    pub build_options: AddRefOptions,
}

/// Write a `u64` in wire byte order.
pub fn write_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Write an `i64` in wire byte order.
pub fn write_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Write an `i32` in wire byte order.
pub fn write_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Write a single byte.
pub fn write_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

/// Write a length-prefixed byte array.
pub fn write_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    write_u64(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

/// Read a `u64`, advancing the slice.
pub fn read_u64(buf: &mut &[u8]) -> Result<u64, ErrorCode> {
    if buf.len() < 8 {
        return Err(ErrorCode::InvalidData);
    }
    let (head, tail) = buf.split_at(8);
    *buf = tail;
    Ok(u64::from_le_bytes(head.try_into().unwrap()))
}

/// Read an `i64`, advancing the slice.
pub fn read_i64(buf: &mut &[u8]) -> Result<i64, ErrorCode> {
    read_u64(buf).map(|v| v as i64)
}

/// Read an `i32`, advancing the slice.
pub fn read_i32(buf: &mut &[u8]) -> Result<i32, ErrorCode> {
    if buf.len() < 4 {
        return Err(ErrorCode::InvalidData);
    }
    let (head, tail) = buf.split_at(4);
    *buf = tail;
    Ok(i32::from_le_bytes(head.try_into().unwrap()))
}

/// Read a single byte, advancing the slice.
pub fn read_u8(buf: &mut &[u8]) -> Result<u8, ErrorCode> {
    let (&head, tail) = buf.split_first().ok_or(ErrorCode::InvalidData)?;
    *buf = tail;
    Ok(head)
}

/// Read a length-prefixed byte array, advancing the slice.
pub fn read_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, ErrorCode> {
    let len = read_u64(buf)? as usize;
    if buf.len() < len {
        return Err(ErrorCode::InvalidData);
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head.to_vec())
}

/// Write an interface descriptor as its two wire words.
pub fn write_descriptor(buf: &mut Vec<u8>, descriptor: InterfaceDescriptor) {
    write_u64(buf, descriptor.object_id.id());
    write_u64(buf, descriptor.destination_zone_id.id());
}

/// Read an interface descriptor, advancing the slice.
pub fn read_descriptor(buf: &mut &[u8]) -> Result<InterfaceDescriptor, ErrorCode> {
    let object_id = ObjectId::new(read_u64(buf)?);
    let destination_zone_id = DestinationZoneId::new(read_u64(buf)?);
    Ok(InterfaceDescriptor::new(object_id, destination_zone_id))
}

impl CallRequest {
    /// Serialise the request envelope.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 * 8 + 1 + 8 + self.payload.len());
        write_u64(&mut buf, self.protocol_version);
        write_u8(&mut buf, self.encoding.to_wire());
        write_u64(&mut buf, self.tag);
        write_u64(&mut buf, self.caller_channel_zone_id.id());
        write_u64(&mut buf, self.caller_zone_id.id());
        write_u64(&mut buf, self.destination_zone_id.id());
        write_u64(&mut buf, self.object_id.id());
        write_u64(&mut buf, self.interface_id.id());
        write_u64(&mut buf, self.method_id.id());
        write_bytes(&mut buf, &self.payload);
        buf
    }

    /// Deserialise a request envelope.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ErrorCode> {
        let buf = &mut buf;
        Ok(Self {
            protocol_version: read_u64(buf)?,
            encoding: Encoding::from_wire(read_u8(buf)?)?,
            tag: read_u64(buf)?,
            caller_channel_zone_id: CallerChannelZoneId::new(read_u64(buf)?),
            caller_zone_id: CallerZoneId::new(read_u64(buf)?),
            destination_zone_id: DestinationZoneId::new(read_u64(buf)?),
            object_id: ObjectId::new(read_u64(buf)?),
            interface_id: InterfaceOrdinal::new(read_u64(buf)?),
            method_id: MethodId::new(read_u64(buf)?),
            payload: read_bytes(buf)?,
        })
    }
}

impl RefRequest {
    /// Serialise the request.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(7 * 8 + 1);
        write_u64(&mut buf, self.protocol_version);
        write_u64(&mut buf, self.destination_channel_zone_id.id());
        write_u64(&mut buf, self.destination_zone_id.id());
        write_u64(&mut buf, self.object_id.id());
        write_u64(&mut buf, self.caller_channel_zone_id.id());
        write_u64(&mut buf, self.caller_zone_id.id());
        write_u64(&mut buf, self.known_direction_zone_id.id());
        write_u8(&mut buf, self.build_options.bits());
        buf
    }

    /// Deserialise a request.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ErrorCode> {
        let buf = &mut buf;
        Ok(Self {
            protocol_version: read_u64(buf)?,
            destination_channel_zone_id: DestinationChannelZoneId::new(read_u64(buf)?),
            destination_zone_id: DestinationZoneId::new(read_u64(buf)?),
            object_id: ObjectId::new(read_u64(buf)?),
            caller_channel_zone_id: CallerChannelZoneId::new(read_u64(buf)?),
            caller_zone_id: CallerZoneId::new(read_u64(buf)?),
            known_direction_zone_id: KnownDirectionZoneId::new(read_u64(buf)?),
            build_options: AddRefOptions::from_bits(read_u8(buf)?)
                .ok_or(ErrorCode::InvalidData)?,
        })
    }
}

/// Serialise a call reply: the wire error code followed by the payload.
pub fn encode_call_reply(result: &Result<Vec<u8>, ErrorCode>) -> Vec<u8> {
    let mut buf = Vec::new();
    match result {
        Ok(payload) => {
            write_i32(&mut buf, 0);
            write_bytes(&mut buf, payload);
        }
        Err(e) => {
            write_i32(&mut buf, e.to_wire());
            write_bytes(&mut buf, &[]);
        }
    }
    buf
}

/// Deserialise a call reply.
pub fn decode_call_reply(mut buf: &[u8]) -> Result<Vec<u8>, ErrorCode> {
    let buf = &mut buf;
    let code = read_i32(buf)?;
    let payload = read_bytes(buf)?;
    match ErrorCode::wire_to_result(code) {
        Ok(()) => Ok(payload),
        Err(e) => Err(e),
    }
}

/// Serialise a count reply, mapping a version mismatch to the
/// [`VERSION_MISMATCH_COUNT`] sentinel.
pub fn encode_count_reply(result: &Result<u64, ErrorCode>) -> Vec<u8> {
    let mut buf = Vec::new();
    match result {
        Ok(count) => {
            write_i32(&mut buf, 0);
            write_u64(&mut buf, *count);
        }
        Err(ErrorCode::InvalidVersion) => {
            write_i32(&mut buf, 0);
            write_u64(&mut buf, VERSION_MISMATCH_COUNT);
        }
        Err(e) => {
            write_i32(&mut buf, e.to_wire());
            write_u64(&mut buf, 0);
        }
    }
    buf
}

/// Deserialise a count reply, translating the sentinel back into
/// [`ErrorCode::InvalidVersion`].
pub fn decode_count_reply(mut buf: &[u8]) -> Result<u64, ErrorCode> {
    let buf = &mut buf;
    let code = read_i32(buf)?;
    let count = read_u64(buf)?;
    ErrorCode::wire_to_result(code)?;
    if count == VERSION_MISMATCH_COUNT {
        return Err(ErrorCode::InvalidVersion);
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_request_round_trip() {
        let request = CallRequest {
            protocol_version: 3,
            encoding: Encoding::Binary,
            tag: 42,
            caller_channel_zone_id: CallerChannelZoneId::new(2),
            caller_zone_id: CallerZoneId::new(1),
            destination_zone_id: DestinationZoneId::new(9),
            object_id: ObjectId::new(88),
            interface_id: InterfaceOrdinal::new(56),
            method_id: MethodId::new(7),
            payload: vec![1, 2, 3, 4, 5, 6, 7, 8, 9],
        };
        let rebuilt = CallRequest::decode(&request.encode()).unwrap();
        assert_eq!(rebuilt, request);
    }

    #[test]
    fn ref_request_round_trip() {
        let request = RefRequest {
            protocol_version: 2,
            destination_channel_zone_id: DestinationChannelZoneId::new(4),
            destination_zone_id: DestinationZoneId::new(9),
            object_id: ObjectId::new(17),
            caller_channel_zone_id: CallerChannelZoneId::new(0),
            caller_zone_id: CallerZoneId::new(1),
            known_direction_zone_id: KnownDirectionZoneId::new(3),
            build_options: AddRefOptions::BUILD_DESTINATION_ROUTE
                | AddRefOptions::BUILD_CALLER_ROUTE,
        };
        let rebuilt = RefRequest::decode(&request.encode()).unwrap();
        assert_eq!(rebuilt, request);
    }

    #[test]
    fn descriptor_is_two_words() {
        let mut buf = Vec::new();
        let descriptor =
            InterfaceDescriptor::new(ObjectId::new(5), DestinationZoneId::new(11));
        write_descriptor(&mut buf, descriptor);
        assert_eq!(buf.len(), 16);
        assert_eq!(read_descriptor(&mut &buf[..]).unwrap(), descriptor);
    }

    #[test]
    fn count_reply_sentinel_marks_version_mismatch() {
        let bytes = encode_count_reply(&Err(ErrorCode::InvalidVersion));
        assert_eq!(decode_count_reply(&bytes), Err(ErrorCode::InvalidVersion));

        let bytes = encode_count_reply(&Ok(3));
        assert_eq!(decode_count_reply(&bytes), Ok(3));

        let bytes = encode_count_reply(&Err(ErrorCode::ObjectNotFound));
        assert_eq!(decode_count_reply(&bytes), Err(ErrorCode::ObjectNotFound));
    }

    #[test]
    fn call_reply_round_trip() {
        let bytes = encode_call_reply(&Ok(vec![9, 9, 9]));
        assert_eq!(decode_call_reply(&bytes).unwrap(), vec![9, 9, 9]);

        let bytes = encode_call_reply(&Err(ErrorCode::InvalidCast));
        assert_eq!(decode_call_reply(&bytes), Err(ErrorCode::InvalidCast));
    }

    #[test]
    fn unknown_encoding_is_rejected() {
        assert_eq!(Encoding::from_wire(200), Err(ErrorCode::IncompatibleSerialisation));
    }
}
