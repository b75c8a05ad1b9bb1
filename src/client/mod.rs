pub mod query_result;
pub mod session;

#[cfg(test)]
mod session_test;

pub use query_result::QueryResult;
pub use session::{PreparedStatement, Session, SessionConfig};
