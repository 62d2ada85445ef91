#![forbid(unsafe_code)]
//! Asynchronous remote file manager over a framed TCP protocol.
//!
//! A server exposes directories of its local filesystem through numeric
//! handles. Clients bind a handle to a directory with `CREATE`, then list,
//! read and write whole files in it, and release it with `DESTROY`.
//!
//! # Getting Started
//!
//! Serving a base directory until Ctrl-C:
//!
//! ```no_run
//! use rfm::{Result, ServerConfig, srv::srv_async};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ServerConfig::new("127.0.0.1", 5001, "FileManagerDir");
//!     srv_async(config, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```
//!
//! Talking to it:
//!
//! ```no_run
//! use rfm::{ClientConfig, RemoteFileManager, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut fm = RemoteFileManager::connect(&ClientConfig::default(), "").await?;
//!     fm.write("a.txt", b"hi").await?;
//!     assert_eq!(fm.read("a.txt").await?, b"hi");
//!     println!("{:?}", fm.list().await?);
//!     fm.destroy().await
//! }
//! ```
//!
//! # Protocol Details
//!
//! ## Framing
//!
//! `length[4] opcode[1] payload[length - 1]`, big-endian. The length counts
//! the opcode byte, is at least 1 and at most [`MAX_FRAME`]. See [`frame`].
//!
//! ## Operations
//!
//! | opcode | request | response |
//! |--------|---------|----------|
//! | `CREATE` 1 | `path` | `status handle` |
//! | `DESTROY` 2 | `handle` | `status handle` |
//! | `LIST` 3 | `handle` | `status names` |
//! | `READ` 4 | `handle name` | `status data` |
//! | `WRITE` 5 | `handle name data` | `status count` |
//! | `BYE` 6 | | none, the connection closes |
//! | `HELLO` 7 | `version` | `status version` |
//!
//! A response reuses the opcode of its request. On failure the status is
//! nonzero and the remaining fields are zero. Unknown opcodes and payloads
//! that do not decode are answered with an `ERR` (255) frame carrying a
//! status, and the connection stays open.
//!
//! ## Handles
//!
//! Handles are nonzero `u32` values drawn from one counter per server and
//! never reused. They are not tied to the connection that created them.
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`).
pub mod client;
pub mod error;
pub mod fcall;
pub mod frame;
pub mod registry;
pub mod serialize;
pub mod srv;
pub mod store;
pub mod transport;
#[macro_use]
pub mod utils;

pub use crate::client::{Channel, ClientConfig, RemoteFileManager};
pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::frame::Frame;
pub use crate::registry::Registry;
pub use crate::srv::{Server, ServerConfig};
pub use crate::store::{DiskStore, FileStore};
pub use crate::utils::Result;
