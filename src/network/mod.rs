pub mod connection;

pub use connection::{Connection, ConnectionConfig, ConnectionState, EventStream};
