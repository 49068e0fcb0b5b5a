//! Fuzz target for request sequences against a live dispatcher.
//!
//! Drives arbitrary receive/abandon/cancel/close/sweep sequences across a
//! few connections and checks that queue accounting holds after every
//! step and that every operation completes before shutdown.

#![no_main]

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use ldap_core::protocol::{encode_int, MessageId, Pdu, RequestTag, TransportHandle};
use ldap_core::transport::{LdapResult, PeerInfo, ResponseEncoder, SecurityFactors, Transport};
use ldap_core::{
    CoreConfig, Dispatcher, HandlerOutcome, OpContext, OperationHandler, ResultCode, ShutdownResult,
};

#[derive(Debug, Arbitrary)]
enum Step {
    Request { conn: u8, msgid: u8, kind: u8 },
    Abandon { conn: u8, msgid: u8, target: u8 },
    Cancel { conn: u8, target: u8 },
    Close { conn: u8 },
    Reconnect { conn: u8 },
    Block { conn: u8, blocked: bool },
    Sweep,
}

struct FuzzTransport {
    handle: TransportHandle,
    blocked: AtomicBool,
}

impl Transport for FuzzTransport {
    fn handle(&self) -> TransportHandle {
        self.handle
    }
    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.blocked.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(buf.len())
    }
    fn stop_reading(&self) {}
    fn close(&self) {}
}

struct NullEncoder;

impl ResponseEncoder for NullEncoder {
    fn encode_result(&self, _msgid: MessageId, _tag: u8, _result: &LdapResult) -> Vec<u8> {
        vec![0]
    }
    fn encode_entry(&self, _msgid: MessageId, _entry: &[u8]) -> Vec<u8> {
        vec![0]
    }
    fn encode_disconnect(&self, _result: &LdapResult) -> Vec<u8> {
        vec![0]
    }
}

/// Searches stream a few entries, polling the abandon flag between them.
struct ShortHandler;

impl OperationHandler for ShortHandler {
    fn handle(&self, ctx: &mut OpContext<'_>) -> HandlerOutcome {
        if ctx.tag() == RequestTag::Search {
            for _ in 0..3 {
                if ctx.is_abandoned() {
                    return HandlerOutcome::Abandoned;
                }
                if ctx.send_entry(b"entry").is_err() {
                    return HandlerOutcome::Done;
                }
            }
        }
        let _ = ctx.send_result(ResultCode::Success, "");
        HandlerOutcome::Done
    }
}

const CONNS: u8 = 3;

fn request(msgid: MessageId, kind: u8) -> Pdu {
    match kind % 5 {
        0 => Pdu::new(msgid, RequestTag::Bind, b"cn=fuzz".to_vec()),
        1 => Pdu::new(msgid, RequestTag::Unbind, Vec::new()),
        2 => Pdu::new(msgid, RequestTag::Modify, Vec::new()),
        3 => Pdu::new(msgid, RequestTag::Extended, encode_int(msgid.wrapping_sub(1))),
        _ => Pdu::new(msgid, RequestTag::Search, Vec::new()),
    }
}

fn accept(d: &Dispatcher, transports: &mut [Option<Arc<FuzzTransport>>], conn: u8) {
    let slot = usize::from(conn % CONNS);
    let t = Arc::new(FuzzTransport { handle: slot as TransportHandle, blocked: AtomicBool::new(false) });
    if d.accept(t.clone(), PeerInfo::default(), SecurityFactors::default()).is_ok() {
        transports[slot] = Some(t);
    }
}

fn check_accounting(d: &Dispatcher) {
    for info in d.connections() {
        let c = &info.counters;
        assert_eq!((info.executing + info.pending) as u64, c.admitted - c.completed);
    }
}

fuzz_target!(|steps: Vec<Step>| {
    let config = CoreConfig {
        worker_threads: 2,
        per_conn_max_executing: 1,
        max_pending: 4,
        max_pending_auth: 8,
        max_connections: CONNS as usize,
        write_timeout_ms: 50,
        ..CoreConfig::default()
    };
    let Ok(d) = Dispatcher::new(&config, Arc::new(ShortHandler), Arc::new(NullEncoder)) else {
        return;
    };
    let mut transports: Vec<Option<Arc<FuzzTransport>>> = vec![None; CONNS as usize];
    for conn in 0..CONNS {
        accept(&d, &mut transports, conn);
    }

    for step in steps.into_iter().take(64) {
        match step {
            Step::Request { conn, msgid, kind } => {
                let msgid = MessageId::from(msgid) + 1;
                let _ = d.receive(TransportHandle::from(conn % CONNS), request(msgid, kind));
            }
            Step::Abandon { conn, msgid, target } => {
                let pdu = Pdu::abandon(MessageId::from(msgid) + 1, MessageId::from(target) + 1);
                let _ = d.receive(TransportHandle::from(conn % CONNS), pdu);
            }
            Step::Cancel { conn, target } => {
                if let Ok(locked) = d.table().lookup(TransportHandle::from(conn % CONNS)) {
                    let handle = locked.unlock();
                    let _ = d.cancel(&handle, MessageId::from(target) + 1);
                }
            }
            Step::Close { conn } => {
                let _ = d.close(TransportHandle::from(conn % CONNS), "fuzz");
            }
            Step::Reconnect { conn } => accept(&d, &mut transports, conn),
            Step::Block { conn, blocked } => {
                if let Some(t) = &transports[usize::from(conn % CONNS)] {
                    t.blocked.store(blocked, Ordering::SeqCst);
                    let _ = d.writable(t.handle);
                }
            }
            Step::Sweep => {
                d.sweep(Instant::now());
            }
        }
        check_accounting(&d);
    }

    for t in transports.iter().flatten() {
        t.blocked.store(false, Ordering::SeqCst);
        let _ = d.writable(t.handle);
    }
    assert_eq!(d.shutdown(Duration::from_secs(10)), ShutdownResult::Complete);
    assert!(d.table().is_empty());
});
