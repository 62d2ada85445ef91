//! Exact-length reads and writes over a stream that may fragment.
//!
//! A single `read` is never assumed to return a whole frame; both helpers loop
//! until the requested byte count has been transferred.

use {
    crate::{error::Error, utils::Result},
    log::trace,
    std::io,
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};

/// Fill `buf` completely from `r`.
///
/// A zero-length read before `buf` is full means the peer closed the stream
/// and yields [`Error::ConnectionClosed`]. Interrupted reads are retried.
pub async fn read_exact_into<R>(r: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]).await {
            Ok(0) => return Err(Error::ConnectionClosed),
            Ok(n) => {
                filled += n;
                trace!("read chunk={} total={}/{}", n, filled, buf.len());
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}

/// Read exactly `n` bytes from `r`.
pub async fn read_exact<R>(r: &mut R, n: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0; n];
    read_exact_into(r, &mut buf).await?;
    Ok(buf)
}

/// Write all of `buf` to `w` and flush it.
///
/// A write accepting zero bytes means the peer is gone and yields
/// [`Error::ConnectionClosed`]. Interrupted writes are retried.
pub async fn write_exact<W>(w: &mut W, buf: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0;
    while written < buf.len() {
        match w.write(&buf[written..]).await {
            Ok(0) => return Err(Error::ConnectionClosed),
            Ok(n) => {
                written += n;
                trace!("write chunk={} total={}/{}", n, written, buf.len());
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    loop {
        match w.flush().await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
}
