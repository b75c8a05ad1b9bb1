//! An asynchronous engine for the CQL native protocol, version 4.
//!
//! `cqlcore` drives a single connection to a single endpoint of a
//! wide-column database speaking the binary framed protocol: it encodes
//! requests into frames, multiplexes them over one duplex transport by
//! stream id, routes responses back to their awaiting callers, fans
//! server-pushed events out to subscribers, and decodes heterogeneous
//! row data into typed values.
//!
//! The entry point is [`Session`]:
//!
//! ```rust,no_run
//! use cqlcore::{Session, SessionConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::connect(
//!     "127.0.0.1:9042".parse()?,
//!     SessionConfig::default(),
//! )
//! .await?;
//!
//! let result = session.execute("SELECT k, v FROM ks.t", &[]).await?;
//! for row in result.rows().unwrap_or_default() {
//!     println!("{:?}", row.columns);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Scope: the protocol engine only. TLS (inject a connected stream via
//! [`Session::connect_over`]), cluster topology, load balancing, retry
//! and paging are layers above; authentication demands are detected and
//! reported, not negotiated.

pub mod client;
pub mod errors;
pub mod frame;
pub mod network;
pub mod serialize;

pub use client::{PreparedStatement, QueryResult, Session, SessionConfig};
pub use errors::{ConnectError, RequestError};
pub use frame::response::event::Event;
pub use frame::server_event_type::EventType;
pub use frame::types::Consistency;
pub use frame::value::CqlValue;
pub use frame::Compression;
pub use network::EventStream;
