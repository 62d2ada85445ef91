//! Protocol constants and data types.
//!
//! # Wire format
//! Every frame is `length[4] opcode[1] payload[length - 1]`, all integers
//! big-endian. Payload fields are `u32` values, strings (`u32` byte length +
//! UTF-8 bytes) and byte blobs (`u32` length + bytes).

use enum_primitive::*;

/// Upper bound of the length prefix (opcode byte + payload)
pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Largest payload a single frame can carry
pub const MAX_PAYLOAD: usize = MAX_FRAME as usize - 1;

/// Largest file a `READ` response can carry: the payload minus the status
/// and the data length field
pub const MAX_READ: usize = MAX_PAYLOAD - 8;

/// Protocol version exchanged by `HELLO`
pub const PROTOCOL_VERSION: u32 = 1;

/// Default TCP port of the server
pub const DEFAULT_PORT: u16 = 5001;

/// Directory handed to `CREATE` requests that carry an empty path
pub const DEFAULT_DIR: &str = "FileManagerDir";

/// Handle value that never names a resource
pub const INVALID_HANDLE: u32 = 0;

/// Status codes carried by responses and `ERR` frames
pub mod status {
    /// Success
    pub const OK: u32 = 0;
    /// The handle is unknown or already destroyed
    pub const HANDLE_NOT_FOUND: u32 = 1;
    /// The opcode is not understood by the server
    pub const UNKNOWN_OPCODE: u32 = 2;
    /// The payload could not be decoded
    pub const MALFORMED: u32 = 3;
    /// `CREATE` could not set up the backing store
    pub const RESOURCE_INIT: u32 = 4;
    /// A filesystem operation failed
    pub const IO: u32 = 5;
    /// `HELLO` carried a protocol version the server does not speak
    pub const UNSUPPORTED_VERSION: u32 = 6;
}

enum_from_primitive! {
    #[doc = "Operation code, the first byte after the length prefix"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub enum Opcode {
        Create          = 1,
        Destroy         = 2,
        List            = 3,
        Read            = 4,
        Write           = 5,
        Bye             = 6,
        Hello           = 7,
        Err             = 255,
    }
}

impl Opcode {
    /// Raw byte value on the wire
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// If a response frame with this opcode is expected for a request
    pub fn has_response(self) -> bool {
        !matches!(self, Opcode::Bye | Opcode::Err)
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op.as_u8()
    }
}

/// Data type used in `READ` responses and `WRITE` requests
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.0.len() > 32 {
            write!(f, "Data({} bytes)", self.0.len())
        } else {
            write!(f, "Data({:?})", &self.0)
        }
    }
}

impl From<Vec<u8>> for Data {
    fn from(v: Vec<u8>) -> Data {
        Data(v)
    }
}

impl From<&[u8]> for Data {
    fn from(v: &[u8]) -> Data {
        Data(v.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn opcode_values() {
        assert_eq!(Opcode::Create.as_u8(), 1);
        assert_eq!(Opcode::Bye.as_u8(), 6);
        assert_eq!(Opcode::Err.as_u8(), 255);
        assert_eq!(Opcode::from_u8(5), Some(Opcode::Write));
        assert_eq!(Opcode::from_u8(7), Some(Opcode::Hello));
        assert_eq!(Opcode::from_u8(0), None);
        assert_eq!(Opcode::from_u8(42), None);
    }

    #[test]
    fn only_requests_have_responses() {
        assert!(Opcode::Read.has_response());
        assert!(!Opcode::Bye.has_response());
        assert!(!Opcode::Err.has_response());
    }

    #[test]
    fn frame_bounds() {
        assert_eq!(MAX_FRAME, 16 * 1024 * 1024);
        assert_eq!(MAX_PAYLOAD + 1, MAX_FRAME as usize);
    }
}
