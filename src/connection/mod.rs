//! Connections: the slot table, per-connection state and the write path.

mod conn;
mod state;
mod table;
pub(crate) mod writer;

pub use conn::{ConnCounters, Connection, ConnectionInfo, ExecutingOp};
pub(crate) use conn::AbandonOutcome;
pub use state::{AuthInfo, ConnState, StructState};
pub use table::{ConnHandle, ConnKey, ConnectionTable, LockedConn, TableConfig};
