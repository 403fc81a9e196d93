//! Multiplexed reverse-tunnel frame engine: many independent logical streams
//! over one TLS-capable byte transport, with per-stream flow control,
//! keep-alive liveness and a graceful tunnel-close handshake.

mod bridge;
pub mod codec;
pub mod config;
pub mod conn;
pub mod error;
pub mod frame;
pub mod info;
pub mod net;
pub mod opcode;
pub mod stream;

pub use config::{Config, ConfigBuilder};
pub use conn::FrameConn;
pub use error::{Result, TunnelError};
pub use frame::Frame;
pub use info::Info;
pub use net::{dial, dial_tls, FrameListener};
pub use opcode::{Opcode, Signal};
pub use stream::Stream;
