//! Client side: a lazily connected request channel and a typed proxy.
//!
//! The protocol carries no request ids, so a [`Channel`] has at most one
//! request in flight. Its methods take `&mut self`; callers sharing a channel
//! wrap it in a mutex, or open one channel each.

use {
    crate::{
        error::Error,
        fcall::*,
        frame::{self, Frame},
        io_err, res,
        serialize::{self, Decodable, Encodable},
        utils::{self, Result},
    },
    log::{debug, info, warn},
    std::{
        path::Path,
        sync::atomic::{AtomicU64, Ordering},
        time::Instant,
    },
    tokio::{io::AsyncWriteExt, net::TcpStream},
};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Resolved client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_owned(),
            port: DEFAULT_PORT,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ClientConfig {
            host: host.into(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        utils::join_host_port(&self.host, self.port)
    }
}

/// One TCP connection to the server, opened on first use.
///
/// Any transport or framing error drops the socket; the next request
/// reconnects.
#[derive(Debug)]
pub struct Channel {
    addr: String,
    id: u64,
    stream: Option<TcpStream>,
}

impl Channel {
    pub fn new(config: &ClientConfig) -> Channel {
        Channel {
            addr: config.addr(),
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            stream: None,
        }
    }

    /// Process-unique id used in log lines
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn connect(&mut self) -> Result<&mut TcpStream> {
        if self.stream.is_none() {
            info!("[c{}] connecting to {}", self.id, self.addr);
            let stream = TcpStream::connect(&self.addr).await?;
            stream.set_nodelay(true)?;
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| Error::Io(io_err!(NotConnected, "no connection")))
    }

    /// Send one request frame and wait for its response frame.
    pub async fn request(&mut self, opcode: Opcode, payload: &[u8]) -> Result<Frame> {
        if !opcode.has_response() {
            return res!(Error::Protocol(format!("{:?} has no response frame", opcode)));
        }

        let id = self.id;
        let start = Instant::now();
        let stream = self.connect().await?;

        let result: Result<Frame> = async {
            frame::write_frame(stream, opcode.as_u8(), payload).await?;
            frame::read_frame(stream).await
        }
        .await;

        match result {
            Ok(response) => {
                debug!(
                    "[c{}] {:?} roundtrip={:?} response={} bytes",
                    id,
                    opcode,
                    start.elapsed(),
                    response.payload.len()
                );
                Ok(response)
            }
            Err(e) => {
                warn!("[c{}] {:?} failed: {}", id, opcode, e);
                self.stream = None;
                Err(e)
            }
        }
    }

    /// Drop the connection without a word, e.g. after a response that does
    /// not match its request.
    pub fn reset(&mut self) {
        if self.stream.take().is_some() {
            warn!("[c{}] out of step with the server, dropping connection", self.id);
        }
    }

    /// Send one request and decode its response with [`unpack`].
    ///
    /// A response that does not decode leaves the stream in an unknown
    /// position, so the connection is reset.
    pub async fn call<T: Decodable>(
        &mut self,
        op: Opcode,
        handle: u32,
        payload: &[u8],
    ) -> Result<T> {
        let response = self.request(op, payload).await?;
        let result = unpack(op, handle, &response);
        if let Err(Error::Protocol(_)) = result {
            self.reset();
        }
        result
    }

    /// Say `BYE` and drop the connection. Errors are ignored: the peer may
    /// already be gone.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = frame::write_frame(&mut stream, Opcode::Bye.as_u8(), &[]).await;
            let _ = stream.shutdown().await;
            info!("[c{}] connection closed", self.id);
        }
    }
}

/// Decode the body of a response to `op`.
///
/// `ERR` frames and nonzero statuses become errors; `handle` is reported in
/// [`Error::HandleNotFound`].
pub fn unpack<T: Decodable>(op: Opcode, handle: u32, response: &Frame) -> Result<T> {
    match response.op() {
        Some(Opcode::Err) => {
            let code: u32 = serialize::decode_payload(&response.payload)?;
            return res!(Error::from_status(code, handle));
        }
        Some(got) if got == op => {}
        _ => {
            return res!(Error::Protocol(format!(
                "expected a {:?} response, got opcode {}",
                op, response.opcode
            )));
        }
    }

    let (code, body) = serialize::split_status(&response.payload)?;
    if code != status::OK {
        return res!(Error::from_status(code, handle));
    }
    serialize::decode_payload(body)
}

/// Only the last path component of a file name is sent to the server.
fn remote_name(name: &str) -> Result<String> {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Io(io_err!(InvalidInput, format!("invalid file name {:?}", name))))
}

/// Proxy for one remote directory handle.
///
/// The handle stays registered on the server until [`destroy`](Self::destroy)
/// is called, or the connection closes on a server that reaps on disconnect.
#[derive(Debug)]
pub struct RemoteFileManager {
    channel: Channel,
    handle: u32,
}

impl RemoteFileManager {
    /// Connect and bind a new handle to `path` on the server.
    pub async fn connect(config: &ClientConfig, path: &str) -> Result<RemoteFileManager> {
        let mut channel = Channel::new(config);
        let handle = create(&mut channel, path).await?;
        debug!("[c{}] remote handle {} for {:?}", channel.id(), handle, path);
        Ok(RemoteFileManager { channel, handle })
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    async fn call<B, T>(&mut self, op: Opcode, body: &B) -> Result<T>
    where
        B: Encodable + ?Sized,
        T: Decodable,
    {
        let payload = serialize::encode_payload(body)?;
        self.channel.call(op, self.handle, &payload).await
    }

    /// Check that the server speaks our protocol version.
    pub async fn hello(&mut self) -> Result<u32> {
        self.call(Opcode::Hello, &PROTOCOL_VERSION).await
    }

    pub async fn list(&mut self) -> Result<Vec<String>> {
        let handle = self.handle;
        self.call(Opcode::List, &handle).await
    }

    pub async fn read(&mut self, name: &str) -> Result<Vec<u8>> {
        let body = (self.handle, remote_name(name)?);
        let data: Data = self.call(Opcode::Read, &body).await?;
        Ok(data.0)
    }

    /// Replace the remote file `name` with `data`.
    pub async fn write(&mut self, name: &str, data: &[u8]) -> Result<u32> {
        let payload = (serialize::Encoder::new(Vec::new()) << &self.handle << &remote_name(name)? << data)
            .into_inner()?
            .into_inner();
        if payload.len() > MAX_PAYLOAD {
            return res!(Error::Protocol(format!(
                "{} bytes do not fit in one frame",
                data.len()
            )));
        }
        self.channel.call(Opcode::Write, self.handle, &payload).await
    }

    /// Release the handle on the server and close the connection.
    pub async fn destroy(mut self) -> Result<()> {
        let handle = self.handle;
        let result: Result<u32> = self.call(Opcode::Destroy, &handle).await;
        self.channel.close().await;
        result.map(|_| ())
    }
}

async fn create(channel: &mut Channel, path: &str) -> Result<u32> {
    let payload = serialize::encode_payload(path)?;
    channel.call(Opcode::Create, INVALID_HANDLE, &payload).await
}
