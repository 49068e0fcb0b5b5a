//! Serialized response writes with slow-client backpressure.
//!
//! One PDU is written at a time per connection. A writer that hits
//! `WouldBlock` raises `writewaiter`, which also stops admission on that
//! connection, and sleeps on the connection's condvar until the transport
//! reports writability or the connection starts closing.

use std::io;
use std::time::Duration;

use super::state::ConnState;
use super::table::ConnHandle;
use crate::error::CoreError;
use crate::telemetry::metrics;

/// Write `bytes` as one PDU, blocking while the client is slow.
///
/// `timeout` bounds each wait for writability. Fails with
/// [`CoreError::Closing`] once the connection is closing; the caller treats
/// `Write` and `WriteTimeout` as fatal to the connection.
pub(crate) fn write_pdu(
    handle: &ConnHandle,
    bytes: &[u8],
    timeout: Option<Duration>,
) -> Result<(), CoreError> {
    let _serial = handle.io.write_lock.lock();
    let mut conn = handle.conn.lock();
    let transport = conn.transport.clone();
    let mut written = 0;

    while written < bytes.len() {
        if matches!(conn.state, ConnState::Closing | ConnState::Invalid) {
            return Err(CoreError::Closing(conn.id));
        }
        match transport.try_write(&bytes[written..]) {
            Ok(0) => return Err(CoreError::Write(io::ErrorKind::WriteZero.into())),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                conn.writewaiter = true;
                metrics::record_write_wait();
                tracing::debug!(conn = conn.id, pending = bytes.len() - written, "writer blocked");
                let timed_out = match timeout {
                    Some(t) => handle.io.write_cv.wait_for(&mut conn, t).timed_out(),
                    None => {
                        handle.io.write_cv.wait(&mut conn);
                        false
                    }
                };
                conn.writewaiter = false;
                if timed_out {
                    return Err(CoreError::WriteTimeout);
                }
            }
            Err(e) => return Err(CoreError::Write(e)),
        }
    }

    conn.counters.bytes_written += written as u64;
    conn.counters.pdus_written += 1;
    Ok(())
}

/// Single non-blocking attempt, for notices sent while tearing down.
pub(crate) fn try_write_once(handle: &ConnHandle, bytes: &[u8]) -> bool {
    let Some(_serial) = handle.io.write_lock.try_lock() else { return false };
    let mut conn = handle.conn.lock();
    match conn.transport.try_write(bytes) {
        Ok(n) if n == bytes.len() => {
            conn.counters.bytes_written += n as u64;
            conn.counters.pdus_written += 1;
            true
        }
        _ => false,
    }
}
