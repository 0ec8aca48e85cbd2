//! SRT channel fan-out with cross-node subscription proxying.
//!
//! A publisher owns one channel per resource; subscribers attach to its
//! pub/sub. When a subscriber asks for a resource whose publisher lives
//! on another node, the server dials the publishing node once, installs a
//! reference-counted proxy entry and fans the upstream out to all local
//! subscribers. The upstream is closed when the last subscriber detaches.
//!
//! The wire protocol (handshakes, encryption, retransmission) lives in
//! the SRT connection implementation behind [`conn::SrtConn`]; this crate
//! only moves frames.

#![warn(missing_docs)]

pub mod conn;
pub mod net;
pub mod pubsub;
pub mod server;

pub use conn::{parse_stream_id, ConnectMode, Dialer, SrtConn, StreamInfo};
pub use net::{serve_srt, FramedConn, TcpDialer};
pub use pubsub::PubSub;
pub use server::{SrtServer, SrtServerConfig};
