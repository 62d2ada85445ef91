#![allow(dead_code)]

use {
    rfm::{
        DiskStore, Frame, Opcode, Registry, Server, ServerConfig,
        frame::{read_frame, write_frame},
        serialize::{Decodable, Encodable, decode_payload, encode_payload, split_status},
    },
    std::{net::SocketAddr, sync::Arc, time::Duration},
    tempfile::TempDir,
    tokio::{net::TcpStream, sync::oneshot, task::JoinHandle},
};

pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<Registry<DiskStore>>,
    pub dir: TempDir,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<rfm::Result<()>>,
}

impl TestServer {
    pub async fn start() -> TestServer {
        TestServer::start_with(|config| config).await
    }

    pub async fn start_with(configure: impl FnOnce(ServerConfig) -> ServerConfig) -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let config = configure(ServerConfig::new("127.0.0.1", 0, dir.path()));
        let server = Server::<DiskStore>::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let registry = server.registry();

        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(server.serve_with_shutdown(async move {
            let _ = stopped.await;
        }));

        TestServer {
            addr,
            registry,
            dir,
            stop: Some(stop),
            task,
        }
    }

    pub fn client_config(&self) -> rfm::ClientConfig {
        rfm::ClientConfig::new("127.0.0.1", self.addr.port())
    }

    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }

    /// Signal shutdown and wait for the accept loop to return.
    pub async fn stop(mut self) -> rfm::Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), &mut self.task)
            .await
            .expect("server did not stop")
            .unwrap()
    }
}

/// Send one request and read its response.
pub async fn call<T: Encodable + ?Sized>(stream: &mut TcpStream, op: Opcode, body: &T) -> Frame {
    let payload = encode_payload(body).unwrap();
    write_frame(stream, op.as_u8(), &payload).await.unwrap();
    read_frame(stream).await.unwrap()
}

/// Status and decoded body of a response to `op`.
pub fn parse<T: Decodable>(op: Opcode, frame: &Frame) -> (u32, T) {
    assert_eq!(frame.op(), Some(op), "unexpected response {:?}", frame);
    let (code, body) = split_status(&frame.payload).unwrap();
    (code, decode_payload(body).unwrap())
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
