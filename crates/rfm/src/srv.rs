//! Server side: opcode dispatch, per-connection loop and accept loop.
//!
//! # Connection lifecycle
//! Each accepted connection runs its own task:
//!
//! 1. Wait for a frame (`AWAIT_FRAME`)
//! 2. Look the opcode up in the [`DispatchTable`] and run the handler (`DISPATCH`)
//! 3. Write exactly one response frame and go back to 1
//!
//! `BYE`, end of stream, a framing error or a failed write ends the task
//! (`CLOSED`). Requests on one connection are strictly sequential; there is no
//! pipelining.
//!
//! # Handles
//! Handles live in one [`Registry`] shared by all connections, so any
//! connection may use a handle another one created. With
//! [`ServerConfig::reap_on_disconnect`] set, the handles a connection created
//! and did not destroy are released when it closes.

use {
    crate::{
        error::Error,
        fcall::*,
        frame::{Frame, FrameCodec},
        io_err,
        registry::Registry,
        res,
        serialize::{self, Encodable},
        store::{DiskStore, FileStore},
        utils::{self, Result},
    },
    futures::{future::BoxFuture, sink::SinkExt},
    log::{debug, error, info, warn},
    num_traits::FromPrimitive,
    std::{
        collections::{HashMap, HashSet},
        future::Future,
        net::SocketAddr,
        path::PathBuf,
        sync::Arc,
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::TcpListener,
        task::JoinSet,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite},
};

/// Registry change made by a request, tracked per connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    None,
    Created(u32),
    Destroyed(u32),
}

/// Outcome of one handler: a status and the fields that follow it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub status: u32,
    pub body: Vec<u8>,
    pub effect: Effect,
}

impl Reply {
    /// Fails if the status and `body` together do not fit in one frame.
    pub fn new<T: Encodable + ?Sized>(status: u32, body: &T) -> Result<Reply> {
        let body = serialize::encode_payload(body)?;
        if body.len() > MAX_PAYLOAD - 4 {
            return res!(Error::Protocol(format!(
                "response body of {} bytes exceeds the frame limit",
                body.len()
            )));
        }
        Ok(Reply {
            status,
            body,
            effect: Effect::None,
        })
    }

    fn with_effect(mut self, effect: Effect) -> Reply {
        self.effect = effect;
        self
    }

    /// Response payload: `status[4]` followed by the body.
    pub fn payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.body.len());
        buf.extend_from_slice(&self.status.to_be_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// Turn the result of a request into a reply.
///
/// Per-request failures are reported in-band: the status carries the error
/// code and `fallback` stands in for the success body.
fn respond<T, F>(op: Opcode, outcome: Result<T>, fallback: F) -> Result<Reply>
where
    T: Encodable,
    F: Encodable,
{
    match outcome {
        Ok(body) => Reply::new(status::OK, &body).or_else(|e| {
            warn!("{:?}: Error: \"{}\"", op, e);
            Reply::new(status::IO, &fallback)
        }),
        Err(e) => {
            warn!("{:?}: Error: \"{}\"", op, e);
            Reply::new(e.status(), &fallback)
        }
    }
}

/// Uniform handler signature. The registry also carries the store collaborator.
///
/// An `Err` means the request itself could not be understood and is answered
/// with an `ERR` frame.
pub type Handler<S> = for<'a> fn(&'a Registry<S>, &'a [u8]) -> BoxFuture<'a, Result<Reply>>;

fn rcreate<'a, S: FileStore>(registry: &'a Registry<S>, payload: &'a [u8]) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move {
        let path: String = serialize::decode_payload(payload)?;
        let outcome = registry.create(&path).await;
        let effect = outcome.as_ref().map_or(Effect::None, |h| Effect::Created(*h));
        Ok(respond(Opcode::Create, outcome, INVALID_HANDLE)?.with_effect(effect))
    })
}

fn rdestroy<'a, S: FileStore>(registry: &'a Registry<S>, payload: &'a [u8]) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move {
        let handle: u32 = serialize::decode_payload(payload)?;
        let (outcome, effect) = if registry.destroy(handle).await {
            (Ok(handle), Effect::Destroyed(handle))
        } else {
            (Err(Error::HandleNotFound(handle)), Effect::None)
        };
        Ok(respond(Opcode::Destroy, outcome, handle)?.with_effect(effect))
    })
}

fn rlist<'a, S: FileStore>(registry: &'a Registry<S>, payload: &'a [u8]) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move {
        let handle: u32 = serialize::decode_payload(payload)?;
        let outcome: Result<Vec<String>> = async {
            let store = registry.lookup(handle).await?;
            Ok(store.list().await?)
        }
        .await;
        respond(Opcode::List, outcome, 0u32)
    })
}

fn rread<'a, S: FileStore>(registry: &'a Registry<S>, payload: &'a [u8]) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move {
        let (handle, name): (u32, String) = serialize::decode_payload(payload)?;
        let outcome: Result<Data> = async {
            let store = registry.lookup(handle).await?;
            let data = store.read(&name).await?;
            if data.len() > MAX_READ {
                return res!(io_err!(
                    InvalidData,
                    format!("{:?} is larger than {} bytes", name, MAX_READ)
                ));
            }
            Ok(Data(data))
        }
        .await;
        respond(Opcode::Read, outcome, 0u32)
    })
}

fn rwrite<'a, S: FileStore>(registry: &'a Registry<S>, payload: &'a [u8]) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move {
        let (handle, name, data): (u32, String, Data) = serialize::decode_payload(payload)?;
        let outcome: Result<u32> = async {
            let store = registry.lookup(handle).await?;
            let written = store.write(&name, &data.0).await?;
            // A frame never carries more than MAX_PAYLOAD bytes.
            Ok(written as u32)
        }
        .await;
        respond(Opcode::Write, outcome, 0u32)
    })
}

fn rhello<'a, S: FileStore>(_: &'a Registry<S>, payload: &'a [u8]) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move {
        let version: u32 = serialize::decode_payload(payload)?;
        let status = if version == PROTOCOL_VERSION {
            status::OK
        } else {
            warn!("client speaks protocol version {}", version);
            status::UNSUPPORTED_VERSION
        };
        Reply::new(status, &PROTOCOL_VERSION)
    })
}

/// Lookup table from opcode to handler.
pub struct DispatchTable<S> {
    handlers: HashMap<Opcode, Handler<S>>,
}

impl<S: FileStore> Default for DispatchTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: FileStore> DispatchTable<S> {
    /// Table with every request opcode of the protocol.
    pub fn new() -> DispatchTable<S> {
        let mut handlers: HashMap<Opcode, Handler<S>> = HashMap::new();
        handlers.insert(Opcode::Create, rcreate::<S>);
        handlers.insert(Opcode::Destroy, rdestroy::<S>);
        handlers.insert(Opcode::List, rlist::<S>);
        handlers.insert(Opcode::Read, rread::<S>);
        handlers.insert(Opcode::Write, rwrite::<S>);
        handlers.insert(Opcode::Hello, rhello::<S>);
        DispatchTable { handlers }
    }

    pub fn get(&self, opcode: u8) -> Option<Handler<S>> {
        Opcode::from_u8(opcode).and_then(|op| self.handlers.get(&op).copied())
    }

    /// Run the handler for `frame` and build the response frame.
    pub async fn dispatch(&self, registry: &Registry<S>, frame: &Frame) -> (Frame, Effect) {
        let Some(handler) = self.get(frame.opcode) else {
            warn!("unknown opcode {}", frame.opcode);
            return (Frame::error(status::UNKNOWN_OPCODE), Effect::None);
        };

        match handler(registry, &frame.payload).await {
            Ok(reply) => (Frame::raw(frame.opcode, reply.payload()), reply.effect),
            Err(e) => {
                error!("opcode {}: Error: \"{}\": {:?}", frame.opcode, e, e);
                (Frame::error(e.status()), Effect::None)
            }
        }
    }
}

/// Resolved server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory for `CREATE` requests with an empty or relative path.
    pub base_dir: PathBuf,
    /// Close connections that send no frame for this long.
    pub idle_timeout: Option<Duration>,
    /// Release the handles a connection created when it closes.
    pub reap_on_disconnect: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_owned(),
            port: DEFAULT_PORT,
            base_dir: PathBuf::from(DEFAULT_DIR),
            idle_timeout: None,
            reap_on_disconnect: false,
        }
    }
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16, base_dir: impl Into<PathBuf>) -> Self {
        ServerConfig {
            host: host.into(),
            port,
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_reap_on_disconnect(mut self, reap: bool) -> Self {
        self.reap_on_disconnect = reap;
        self
    }

    /// `host:port` to bind
    pub fn addr(&self) -> String {
        utils::join_host_port(&self.host, self.port)
    }
}

/// Everything a connection task shares with the server.
struct Shared<S> {
    registry: Arc<Registry<S>>,
    table: DispatchTable<S>,
    idle_timeout: Option<Duration>,
    reap_on_disconnect: bool,
}

/// Drive one connection until it closes.
async fn handle_connection<S, Reader, Writer>(
    id: u64,
    shared: Arc<Shared<S>>,
    reader: Reader,
    writer: Writer,
) -> Result<()>
where
    S: FileStore,
    Reader: AsyncRead + Send + Unpin,
    Writer: AsyncWrite + Send + Unpin,
{
    let mut framedread = FramedRead::new(reader, FrameCodec);
    let mut framedwrite = FramedWrite::new(writer, FrameCodec);
    let mut created = HashSet::new();

    let result = loop {
        let next = match shared.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, framedread.next()).await {
                Ok(next) => next,
                Err(_) => {
                    info!("[{}] idle for {:?}, closing", id, limit);
                    break Ok(());
                }
            },
            None => framedread.next().await,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break Err(e),
            None => break Ok(()),
        };

        if frame.op() == Some(Opcode::Bye) {
            info!("[{}] client signaled bye", id);
            break Ok(());
        }

        debug!("[{}]\t← opcode={} {} bytes", id, frame.opcode, frame.payload.len());
        let (response, effect) = shared.table.dispatch(&shared.registry, &frame).await;
        match effect {
            Effect::Created(h) => {
                created.insert(h);
            }
            Effect::Destroyed(h) => {
                created.remove(&h);
            }
            Effect::None => {}
        }

        debug!("[{}]\t→ opcode={} {} bytes", id, response.opcode, response.payload.len());
        if let Err(e) = framedwrite.send(response).await {
            break Err(e);
        }
    };

    if shared.reap_on_disconnect && !created.is_empty() {
        let released = shared.registry.destroy_all(created).await;
        info!("[{}] released {} handle(s) left open", id, released);
    }

    result
}

/// Log how a connection ended. A peer going away is not an error.
fn log_close(id: u64, result: Result<()>) {
    match result {
        Ok(()) => info!("[{}] connection closed", id),
        Err(e) if e.is_disconnect() => info!("[{}] peer disconnected: {}", id, e),
        Err(e) => error!("[{}] Error: {}: {:?}", id, e, e),
    }
}

/// TCP server owning the listener and the shared registry.
///
/// There is no cap on concurrent connections: every accepted socket gets a
/// task.
pub struct Server<S> {
    listener: TcpListener,
    shared: Arc<Shared<S>>,
    next_id: u64,
}

impl<S: FileStore> Server<S> {
    pub async fn bind(config: ServerConfig) -> Result<Server<S>> {
        let listener = TcpListener::bind(config.addr()).await?;
        info!(
            "listening on {} dir={:?}",
            listener.local_addr()?,
            config.base_dir
        );

        Ok(Server {
            listener,
            shared: Arc::new(Shared {
                registry: Arc::new(Registry::new(config.base_dir)),
                table: DispatchTable::new(),
                idle_timeout: config.idle_timeout,
                reap_on_disconnect: config.reap_on_disconnect,
            }),
            next_id: 1,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<Registry<S>> {
        self.shared.registry.clone()
    }

    /// Accept connections forever.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(futures::future::pending()).await
    }

    /// Accept connections until `shutdown` completes, then abort and join
    /// the connection tasks still running.
    pub async fn serve_with_shutdown<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn(&mut tasks, stream, peer),
                    Err(e) => {
                        error!("accept failed: {}", e);
                        // Give transient conditions such as fd exhaustion time to clear.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("connection task failed: {}", e);
                    }
                }
            }
        }

        info!("shutting down, {} connection(s) open", tasks.len());
        tasks.shutdown().await;
        info!("Server shutdown complete");
        Ok(())
    }

    fn spawn(&mut self, tasks: &mut JoinSet<()>, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;
        info!("[{}] accepted: {:?}", id, peer);

        let shared = self.shared.clone();
        tasks.spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            log_close(id, handle_connection(id, shared, readhalf, writehalf).await);
        });
    }
}

/// Serve a [`DiskStore`] backed registry on `config` until `shutdown` completes.
pub async fn srv_async<F>(config: ServerConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    Server::<DiskStore>::bind(config)
        .await?
        .serve_with_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use {super::*, crate::serialize::{decode_payload, encode_payload, split_status}};

    fn setup() -> (tempfile::TempDir, Registry<DiskStore>, DispatchTable<DiskStore>) {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Registry::new(tmp.path());
        (tmp, registry, DispatchTable::new())
    }

    async fn call<T: Encodable + ?Sized>(
        table: &DispatchTable<DiskStore>,
        registry: &Registry<DiskStore>,
        op: Opcode,
        body: &T,
    ) -> Reply {
        let handler = table.get(op.as_u8()).unwrap();
        handler(registry, &encode_payload(body).unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn create_then_use() {
        let (tmp, registry, table) = setup();

        let reply = call(&table, &registry, Opcode::Create, "work").await;
        assert_eq!(reply.status, status::OK);
        assert_eq!(reply.effect, Effect::Created(1));
        assert_eq!(decode_payload::<u32>(&reply.body).unwrap(), 1);

        let reply = call(&table, &registry, Opcode::Write, &(1u32, "a.txt", Data(b"hi".to_vec()))).await;
        assert_eq!(reply.status, status::OK);
        assert_eq!(decode_payload::<u32>(&reply.body).unwrap(), 2);
        assert_eq!(std::fs::read(tmp.path().join("work/a.txt")).unwrap(), b"hi");

        let reply = call(&table, &registry, Opcode::Read, &(1u32, "a.txt")).await;
        assert_eq!(reply.status, status::OK);
        assert_eq!(decode_payload::<Data>(&reply.body).unwrap().0, b"hi");

        let reply = call(&table, &registry, Opcode::List, &1u32).await;
        assert_eq!(decode_payload::<Vec<String>>(&reply.body).unwrap(), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn destroy_echoes_handle() {
        let (_tmp, registry, table) = setup();
        call(&table, &registry, Opcode::Create, "").await;

        let reply = call(&table, &registry, Opcode::Destroy, &1u32).await;
        assert_eq!((reply.status, reply.effect), (status::OK, Effect::Destroyed(1)));
        assert_eq!(decode_payload::<u32>(&reply.body).unwrap(), 1);

        let reply = call(&table, &registry, Opcode::Destroy, &1u32).await;
        assert_eq!((reply.status, reply.effect), (status::HANDLE_NOT_FOUND, Effect::None));
        assert_eq!(decode_payload::<u32>(&reply.body).unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_handle_keeps_response_shape() {
        let (_tmp, registry, table) = setup();

        for (op, body) in [
            (Opcode::List, encode_payload(&7u32).unwrap()),
            (Opcode::Read, encode_payload(&(7u32, "a")).unwrap()),
            (Opcode::Write, encode_payload(&(7u32, "a", Data(vec![1])))
                .unwrap()),
        ] {
            let reply = table.get(op.as_u8()).unwrap()(&registry, &body).await.unwrap();
            assert_eq!(reply.status, status::HANDLE_NOT_FOUND, "{:?}", op);
            assert_eq!(reply.body, [0, 0, 0, 0], "{:?}", op);
        }
    }

    #[tokio::test]
    async fn filesystem_errors_are_statuses() {
        let (_tmp, registry, table) = setup();
        call(&table, &registry, Opcode::Create, "").await;

        let reply = call(&table, &registry, Opcode::Read, &(1u32, "missing")).await;
        assert_eq!(reply.status, status::IO);
        let reply = call(&table, &registry, Opcode::Write, &(1u32, "../x", Data(vec![]))).await;
        assert_eq!(reply.status, status::IO);
    }

    #[tokio::test]
    async fn create_failure_is_resource_init() {
        let (tmp, registry, table) = setup();
        std::fs::write(tmp.path().join("f"), b"").unwrap();

        let reply = call(&table, &registry, Opcode::Create, "f").await;
        assert_eq!(reply.status, status::RESOURCE_INIT);
        assert_eq!(reply.effect, Effect::None);
        assert_eq!(decode_payload::<u32>(&reply.body).unwrap(), INVALID_HANDLE);
    }

    #[tokio::test]
    async fn hello_checks_version() {
        let (_tmp, registry, table) = setup();
        let reply = call(&table, &registry, Opcode::Hello, &PROTOCOL_VERSION).await;
        assert_eq!(reply.status, status::OK);
        let reply = call(&table, &registry, Opcode::Hello, &99u32).await;
        assert_eq!(reply.status, status::UNSUPPORTED_VERSION);
        assert_eq!(decode_payload::<u32>(&reply.body).unwrap(), PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_and_malformed() {
        let (_tmp, registry, table) = setup();
        assert!(table.get(Opcode::Bye.as_u8()).is_none());

        let (resp, _) = table.dispatch(&registry, &Frame::raw(42, Vec::<u8>::new())).await;
        assert_eq!(resp, Frame::error(status::UNKNOWN_OPCODE));

        let (resp, _) = table.dispatch(&registry, &Frame::raw(Opcode::Read.as_u8(), vec![0u8, 0])).await;
        assert_eq!(resp, Frame::error(status::MALFORMED));
    }

    #[tokio::test]
    async fn dispatch_prefixes_status() {
        let (_tmp, registry, table) = setup();
        let req = Frame::new(Opcode::Create, encode_payload("").unwrap());
        let (resp, effect) = table.dispatch(&registry, &req).await;
        assert_eq!(resp.op(), Some(Opcode::Create));
        assert_eq!(effect, Effect::Created(1));
        let (code, rest) = split_status(&resp.payload).unwrap();
        assert_eq!((code, decode_payload::<u32>(rest).unwrap()), (status::OK, 1));
    }

    #[test]
    fn reply_must_fit_one_frame() {
        let reply = respond(Opcode::Read, Ok(Data(vec![0; MAX_READ])), 0u32).unwrap();
        assert_eq!(reply.status, status::OK);
        assert_eq!(reply.payload().len(), MAX_PAYLOAD);

        let reply = respond(Opcode::Read, Ok(Data(vec![0; MAX_READ + 1])), 0u32).unwrap();
        assert_eq!(reply.status, status::IO);
        assert_eq!(reply.body, [0, 0, 0, 0]);
    }

    #[test]
    fn config_address() {
        let config = ServerConfig::new("::1", 7000, "/tmp")
            .with_idle_timeout(Some(Duration::from_secs(5)))
            .with_reap_on_disconnect(true);
        assert_eq!(config.addr(), "[::1]:7000");
        assert!(config.reap_on_disconnect);
        assert_eq!(ServerConfig::default().addr(), "0.0.0.0:5001");
    }
}
