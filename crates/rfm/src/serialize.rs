//! Serialize/deserialize payload fields into/from binary.

use crate::{error::Error, fcall::*, io_err, res, utils};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

/// Preallocation cap for counts read off the wire
const MAX_PREALLOC: usize = 1024;

/// Read exactly `size` bytes without trusting `size` for the allocation.
fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(size.min(MAX_PREALLOC));
    r.take(size as u64).read_to_end(&mut buf)?;
    if buf.len() != size {
        return res!(io_err!(UnexpectedEof, "field extends past the payload"));
    }
    Ok(buf)
}

fn field_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| io_err!(InvalidInput, "field longer than u32::MAX"))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(::std::io::Result<T>);

impl<T> SResult<T> {
    pub fn into_inner(self) -> Result<T> {
        self.0
    }
}

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable + ?Sized>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable + ?Sized, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable + ?Sized, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<BigEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for str {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = field_len(self.len())?.encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.as_str().encode(w)
    }
}

impl Encodable for [u8] {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let bytes = field_len(self.len())?.encode(w)? + self.len();
        w.write_all(self)?;
        Ok(bytes)
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.0.as_slice().encode(w)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self
            .iter()
            .fold(Encoder::new(w) << &field_len(self.len())?, |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl<T: Encodable + ?Sized> Encodable for &T {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (**self).encode(w)
    }
}

impl Encodable for () {
    fn encode<W: WriteBytesExt>(&self, _: &mut W) -> Result<usize> {
        Ok(0)
    }
}

impl<A: Encodable, B: Encodable> Encodable for (A, B) {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.0 << &self.1 {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl<A: Encodable, B: Encodable, C: Encodable> Encodable for (A, B, C) {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.0 << &self.1 << &self.2 {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<BigEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(InvalidData, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        let mut buf = Vec::with_capacity((len as usize).min(MAX_PREALLOC));
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

impl Decodable for () {
    fn decode<R: ReadBytesExt>(_: &mut R) -> Result<Self> {
        Ok(())
    }
}

impl<A: Decodable, B: Decodable> Decodable for (A, B) {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok((Decodable::decode(r)?, Decodable::decode(r)?))
    }
}

impl<A: Decodable, B: Decodable, C: Decodable> Decodable for (A, B, C) {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok((
            Decodable::decode(r)?,
            Decodable::decode(r)?,
            Decodable::decode(r)?,
        ))
    }
}

fn malformed(e: std::io::Error) -> Error {
    Error::Protocol(format!("malformed payload: {}", e))
}

/// Encode a whole payload.
pub fn encode_payload<T: Encodable + ?Sized>(body: &T) -> utils::Result<Vec<u8>> {
    let mut buf = Vec::new();
    body.encode(&mut buf)?;
    if buf.len() > MAX_PAYLOAD {
        return res!(Error::Protocol(format!(
            "payload of {} bytes exceeds the frame limit",
            buf.len()
        )));
    }
    Ok(buf)
}

/// Decode a whole payload, rejecting bytes left over after `T`.
pub fn decode_payload<T: Decodable>(payload: &[u8]) -> utils::Result<T> {
    let mut cursor = Cursor::new(payload);
    let value = T::decode(&mut cursor).map_err(malformed)?;
    let trailing = payload.len() as u64 - cursor.position();
    if trailing != 0 {
        return res!(Error::Protocol(format!(
            "malformed payload: {} trailing bytes",
            trailing
        )));
    }
    Ok(value)
}

/// Split the leading status field off a response payload.
pub fn split_status(payload: &[u8]) -> utils::Result<(u32, &[u8])> {
    let mut rest = payload;
    let status = rest.read_u32::<BigEndian>().map_err(malformed)?;
    Ok((status, rest))
}

#[test]
fn encoder_test1() {
    let expected: Vec<u8> = (0..10).collect();
    let mut encoder = Vec::new();
    for i in 0..10 {
        (&(i as u8)).encode(&mut encoder).unwrap();
    }
    assert_eq!(expected, encoder);
}

#[test]
fn decoder_test1() {
    let expected: Vec<u8> = (0..10).collect();
    let mut decoder = Cursor::new(expected.clone());
    let mut actual: Vec<u8> = Vec::new();
    loop {
        match Decodable::decode(&mut decoder) {
            Ok(i) => actual.push(i),
            Err(_) => break,
        }
    }
    assert_eq!(expected, actual);
}

#[test]
fn u32_is_big_endian() {
    let mut buf = Vec::new();
    0x0102_0304u32.encode(&mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3, 4]);
}

#[test]
fn string_layout() {
    let buf = encode_payload("a.txt").unwrap();
    assert_eq!(buf, [0, 0, 0, 5, b'a', b'.', b't', b'x', b't']);
    assert_eq!(decode_payload::<String>(&buf).unwrap(), "a.txt");
}

#[test]
fn write_request_layout() {
    let buf = encode_payload(&(1u32, "a.txt", Data(b"hi".to_vec()))).unwrap();
    assert_eq!(buf.len(), 4 + 4 + 5 + 4 + 2);

    let (handle, name, data): (u32, String, Data) = decode_payload(&buf).unwrap();
    assert_eq!(handle, 1);
    assert_eq!(name, "a.txt");
    assert_eq!(data.0, b"hi");
}

#[test]
fn operator_chain() {
    let enc = (Encoder::new(Vec::new()) << &7u32 << "x").into_inner().unwrap();
    assert_eq!(enc.bytes_written(), 9);

    let (mut handle, mut name) = (0u32, String::new());
    let dec = Decoder::new(Cursor::new(enc.into_inner())) >> &mut handle >> &mut name;
    assert!(dec.into_inner().is_ok());
    assert_eq!((handle, name.as_str()), (7, "x"));
}

#[test]
fn name_list_uses_u32_count() {
    let names = vec!["a".to_owned(), "bc".to_owned()];
    let buf = encode_payload(&names).unwrap();
    assert_eq!(&buf[..4], &[0, 0, 0, 2]);
    assert_eq!(decode_payload::<Vec<String>>(&buf).unwrap(), names);
}

#[test]
fn truncated_field_is_malformed() {
    let mut buf = encode_payload(&(1u32, "a.txt")).unwrap();
    buf.truncate(buf.len() - 1);
    match decode_payload::<(u32, String)>(&buf) {
        Err(Error::Protocol(_)) => {}
        r => panic!("unexpected {:?}", r),
    }
    match decode_payload::<u32>(&[0, 1]) {
        Err(Error::Protocol(_)) => {}
        r => panic!("unexpected {:?}", r),
    }
}

#[test]
fn huge_claimed_length_does_not_allocate() {
    let buf = [0xff, 0xff, 0xff, 0xff, b'x'];
    assert!(decode_payload::<Data>(&buf).is_err());
    assert!(decode_payload::<Vec<String>>(&buf).is_err());
}

#[test]
fn trailing_bytes_are_rejected() {
    let mut buf = encode_payload(&3u32).unwrap();
    buf.push(0);
    assert!(matches!(decode_payload::<u32>(&buf), Err(Error::Protocol(_))));
}

#[test]
fn invalid_utf8_is_rejected() {
    let buf = [0, 0, 0, 2, 0xc3, 0x28];
    assert!(matches!(
        decode_payload::<String>(&buf),
        Err(Error::Protocol(_))
    ));
}

#[test]
fn status_split() {
    let buf = encode_payload(&(status::HANDLE_NOT_FOUND, 0u32)).unwrap();
    let (code, rest) = split_status(&buf).unwrap();
    assert_eq!(code, status::HANDLE_NOT_FOUND);
    assert_eq!(rest, &[0, 0, 0, 0]);
    assert!(split_status(&[0, 0]).is_err());
}
