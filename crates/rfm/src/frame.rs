//! Frame codec: `length[4] opcode[1] payload[length - 1]`.
//!
//! The length prefix is big-endian and counts the opcode byte plus the payload,
//! so a valid prefix is always at least 1 and never above [`MAX_FRAME`]. The
//! prefix is validated before any payload buffer is reserved, so a corrupt or
//! hostile length cannot make the reader allocate.
//!
//! Two entry points share the validation:
//! - [`read_frame`]/[`write_frame`] drive a stream directly through the exact
//!   I/O helpers of [`crate::transport`],
//! - [`FrameCodec`] plugs into `tokio_util::codec::{FramedRead, FramedWrite}`.

use {
    crate::{
        error::Error,
        fcall::*,
        res, transport,
        utils::Result,
    },
    bytes::{Buf, BufMut, Bytes, BytesMut},
    log::debug,
    num_traits::FromPrimitive,
    tokio::io::{AsyncRead, AsyncWrite},
    tokio_util::codec,
};

/// Size of the length prefix
pub const LENGTH_FIELD: usize = 4;

/// Length prefix plus opcode byte
pub const HEADER_LEN: usize = LENGTH_FIELD + 1;

/// One opcode + payload unit.
///
/// The opcode is kept as the raw byte so that frames with opcodes this side
/// does not know still decode; rejecting them is up to the receiver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Frame {
        Frame {
            opcode: opcode.as_u8(),
            payload: payload.into(),
        }
    }

    /// Frame with a raw opcode byte
    pub fn raw(opcode: u8, payload: impl Into<Bytes>) -> Frame {
        Frame {
            opcode,
            payload: payload.into(),
        }
    }

    /// `ERR` frame carrying `code`
    pub fn error(code: u32) -> Frame {
        Frame::new(Opcode::Err, code.to_be_bytes().to_vec())
    }

    /// The opcode, if it is a known one
    pub fn op(&self) -> Option<Opcode> {
        Opcode::from_u8(self.opcode)
    }

    /// Number of bytes the frame occupies on the wire
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Validate a length prefix.
pub fn check_length(length: u32) -> Result<()> {
    if length == 0 {
        return res!(Error::Protocol("frame length 0, opcode missing".to_owned()));
    }
    if length > MAX_FRAME {
        return res!(Error::Protocol(format!(
            "frame length {} exceeds the limit of {}",
            length, MAX_FRAME
        )));
    }
    Ok(())
}

fn frame_length(payload_len: usize) -> Result<u32> {
    if payload_len > MAX_PAYLOAD {
        return res!(Error::Protocol(format!(
            "payload of {} bytes exceeds the limit of {}",
            payload_len, MAX_PAYLOAD
        )));
    }
    Ok(payload_len as u32 + 1)
}

/// Append the encoded frame to `dst`.
pub fn encode_into(opcode: u8, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let length = frame_length(payload.len())?;
    dst.reserve(HEADER_LEN + payload.len());
    dst.put_u32(length);
    dst.put_u8(opcode);
    dst.put_slice(payload);
    Ok(())
}

/// Encode one frame: exactly `5 + payload.len()` bytes.
pub fn encode(opcode: u8, payload: &[u8]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_into(opcode, payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Read one complete frame from `r`.
pub async fn read_frame<R>(r: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    transport::read_exact_into(r, &mut header[..LENGTH_FIELD]).await?;
    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    check_length(length)?;

    transport::read_exact_into(r, &mut header[LENGTH_FIELD..]).await?;
    let payload = transport::read_exact(r, length as usize - 1).await?;
    debug!(
        "recv frame opcode={} payload={}",
        header[LENGTH_FIELD],
        payload.len()
    );

    Ok(Frame {
        opcode: header[LENGTH_FIELD],
        payload: payload.into(),
    })
}

/// Write one frame to `w`.
pub async fn write_frame<W>(w: &mut W, opcode: u8, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode(opcode, payload)?;
    transport::write_exact(w, &bytes).await?;
    debug!("sent frame opcode={} payload={}", opcode, payload.len());
    Ok(())
}

/// `tokio_util` codec for [`Frame`].
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameCodec;

impl codec::Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < LENGTH_FIELD {
            return Ok(None);
        }

        let length = (&src[..LENGTH_FIELD]).get_u32();
        check_length(length)?;

        let total = LENGTH_FIELD + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD);
        let opcode = src.get_u8();
        let payload = src.split_to(length as usize - 1).freeze();
        Ok(Some(Frame { opcode, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            // The stream ended inside a frame.
            None => Err(Error::ConnectionClosed),
        }
    }
}

impl codec::Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        encode_into(frame.opcode, &frame.payload, dst)
    }
}
