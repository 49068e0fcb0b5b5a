//! Shared fakes for integration tests: a scriptable transport, a text
//! encoder whose output is easy to assert on, and a handler whose
//! operations can be held mid-execution.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ldap_core::connection::{AuthInfo, ConnHandle};
use ldap_core::protocol::{
    decode_int, Decoded, DecodeError, MessageId, Pdu, PduSource, RequestTag, TransportHandle,
};
use ldap_core::scheduler::AdmissionLimits;
use ldap_core::transport::{LdapResult, PeerInfo, ResponseEncoder, SecurityFactors, Transport};
use ldap_core::{CoreConfig, Dispatcher, HandlerOutcome, OpContext, OperationHandler, ResultCode};

pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

// ---------------------------------------------------------------------------
// Transport

pub struct MockTransport {
    handle: TransportHandle,
    written: Mutex<Vec<u8>>,
    pub blocked: AtomicBool,
    pub broken: AtomicBool,
    pub reading: AtomicBool,
    pub closed: AtomicBool,
}

impl MockTransport {
    pub fn new(handle: TransportHandle) -> Arc<Self> {
        Arc::new(Self {
            handle,
            written: Mutex::new(Vec::new()),
            blocked: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            reading: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        })
    }

    pub fn block(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn lines(&self) -> Vec<String> {
        let bytes = self.written.lock().unwrap().clone();
        String::from_utf8_lossy(&bytes).lines().map(str::to_string).collect()
    }

    /// `(msgid, code)` of every result written so far.
    pub fn results(&self) -> Vec<(MessageId, u32)> {
        self.lines()
            .iter()
            .filter_map(|l| {
                let mut parts = l.split_whitespace();
                if parts.next()? != "result" {
                    return None;
                }
                let msgid = parts.next()?.parse().ok()?;
                let _tag = parts.next()?;
                let code = parts.next()?.parse().ok()?;
                Some((msgid, code))
            })
            .collect()
    }

    pub fn result_for(&self, msgid: MessageId) -> Option<u32> {
        self.results().into_iter().find(|(m, _)| *m == msgid).map(|(_, c)| c)
    }

    pub fn entries_for(&self, msgid: MessageId) -> usize {
        let prefix = format!("entry {msgid} ");
        self.lines().iter().filter(|l| l.starts_with(&prefix)).count()
    }

    pub fn disconnects(&self) -> Vec<u32> {
        self.lines()
            .iter()
            .filter_map(|l| l.strip_prefix("disconnect ")?.parse().ok())
            .collect()
    }
}

impl Transport for MockTransport {
    fn handle(&self) -> TransportHandle {
        self.handle
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if self.blocked.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn stop_reading(&self) {
        self.reading.store(false, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Encoder

/// One text line per PDU.
pub struct TextEncoder;

impl ResponseEncoder for TextEncoder {
    fn encode_result(&self, msgid: MessageId, response_tag: u8, result: &LdapResult) -> Vec<u8> {
        format!("result {msgid} {response_tag:#x} {}\n", result.code.code()).into_bytes()
    }

    fn encode_entry(&self, msgid: MessageId, entry: &[u8]) -> Vec<u8> {
        format!("entry {msgid} {}\n", entry.len()).into_bytes()
    }

    fn encode_disconnect(&self, result: &LdapResult) -> Vec<u8> {
        format!("disconnect {}\n", result.code.code()).into_bytes()
    }
}

// ---------------------------------------------------------------------------
// Handler

/// Request values with special meaning to [`TestHandler`].
pub const PERSIST: &[u8] = b"persist";
pub const PROTOCOL_ERROR: &[u8] = b"protoerr";
pub const IGNORE_ABANDON: &[u8] = b"stubborn";
pub const PANIC: &[u8] = b"panic";

#[derive(Default)]
struct HandlerState {
    held: HashSet<MessageId>,
    started: Vec<MessageId>,
    finished: Vec<MessageId>,
    /// Bound DN each operation saw when it ran.
    identities: HashMap<MessageId, String>,
    threads: HashMap<MessageId, String>,
}

/// Handler with per-msgid holds.
///
/// - Bind installs the request value as the bound DN.
/// - Search sends one entry then success; `PERSIST` parks it,
///   `PROTOCOL_ERROR` fails the connection, `PANIC` panics.
/// - Extended treats its value as the msgid to cancel.
/// - Everything else succeeds.
///
/// A held operation blocks until released or abandoned; with
/// `IGNORE_ABANDON` it ignores the abandon flag.
#[derive(Default)]
pub struct TestHandler {
    state: Mutex<HandlerState>,
    cv: Condvar,
}

impl TestHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn hold(&self, msgid: MessageId) {
        self.state.lock().unwrap().held.insert(msgid);
    }

    pub fn release(&self, msgid: MessageId) {
        self.state.lock().unwrap().held.remove(&msgid);
        self.cv.notify_all();
    }

    pub fn started(&self) -> Vec<MessageId> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn finished(&self) -> Vec<MessageId> {
        self.state.lock().unwrap().finished.clone()
    }

    pub fn has_started(&self, msgid: MessageId) -> bool {
        self.started().contains(&msgid)
    }

    pub fn has_finished(&self, msgid: MessageId) -> bool {
        self.finished().contains(&msgid)
    }

    pub fn identity_of(&self, msgid: MessageId) -> Option<String> {
        self.state.lock().unwrap().identities.get(&msgid).cloned()
    }

    pub fn thread_of(&self, msgid: MessageId) -> Option<String> {
        self.state.lock().unwrap().threads.get(&msgid).cloned()
    }

    pub fn wait_started(&self, msgid: MessageId) -> bool {
        wait_until(WAIT, || self.has_started(msgid))
    }

    pub fn wait_finished(&self, msgid: MessageId) -> bool {
        wait_until(WAIT, || self.has_finished(msgid))
    }

    /// Block while `msgid` is held. Returns false if abandoned meanwhile.
    fn wait_released(&self, ctx: &OpContext<'_>, msgid: MessageId, stubborn: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        while state.held.contains(&msgid) {
            if !stubborn && ctx.is_abandoned() {
                return false;
            }
            state = self.cv.wait_timeout(state, Duration::from_millis(5)).unwrap().0;
        }
        true
    }

    fn run(&self, ctx: &mut OpContext<'_>) -> HandlerOutcome {
        let value = ctx.op().request_value().to_vec();
        match ctx.tag() {
            RequestTag::Bind => {
                let dn = String::from_utf8_lossy(&value).into_owned();
                ctx.set_bound_identity(AuthInfo::simple(dn, 3));
                let _ = ctx.send_result(ResultCode::Success, "");
                HandlerOutcome::Done
            }
            RequestTag::Search if value == PERSIST => {
                ctx.mark_persistent();
                HandlerOutcome::Persistent
            }
            RequestTag::Search if value == PANIC => panic!("handler failure on msgid {}", ctx.msgid()),
            RequestTag::Search if value == PROTOCOL_ERROR => {
                HandlerOutcome::ProtocolError("bad filter".into())
            }
            RequestTag::Search => {
                if ctx.send_entry(b"dn: cn=x").is_err() {
                    return HandlerOutcome::Done;
                }
                let _ = ctx.send_result(ResultCode::Success, "");
                HandlerOutcome::Done
            }
            RequestTag::Extended => {
                let code = match decode_int(&value) {
                    Ok(target) => ctx.cancel(target),
                    Err(_) => ResultCode::ProtocolError,
                };
                let _ = ctx.send_result(code, "");
                HandlerOutcome::Done
            }
            _ => {
                let _ = ctx.send_result(ResultCode::Success, "");
                HandlerOutcome::Done
            }
        }
    }
}

impl OperationHandler for TestHandler {
    fn handle(&self, ctx: &mut OpContext<'_>) -> HandlerOutcome {
        let msgid = ctx.msgid();
        let stubborn = ctx.op().request_value() == IGNORE_ABANDON;
        {
            let mut state = self.state.lock().unwrap();
            state.started.push(msgid);
            state.identities.insert(msgid, ctx.auth().dn.clone());
            let thread = std::thread::current().name().unwrap_or("").to_string();
            state.threads.insert(msgid, thread);
        }
        let outcome = if self.wait_released(ctx, msgid, stubborn) {
            self.run(ctx)
        } else {
            HandlerOutcome::Abandoned
        };
        self.state.lock().unwrap().finished.push(msgid);
        self.cv.notify_all();
        outcome
    }
}

// ---------------------------------------------------------------------------
// Wiring

pub fn config(workers: usize, per_conn: usize, max_pending: usize) -> CoreConfig {
    CoreConfig {
        worker_threads: workers,
        per_conn_max_executing: per_conn,
        max_pending,
        max_pending_auth: max_pending * 4,
        max_connections: 16,
        write_timeout_ms: 2_000,
        ..CoreConfig::default()
    }
}

pub fn dispatcher(config: &CoreConfig) -> (Dispatcher, Arc<TestHandler>) {
    let handler = TestHandler::new();
    let d = Dispatcher::new(config, handler.clone(), Arc::new(TextEncoder)).unwrap();
    (d, handler)
}

pub fn connect(d: &Dispatcher, th: TransportHandle) -> (Arc<MockTransport>, ConnHandle) {
    let transport = MockTransport::new(th);
    let handle = d
        .accept(transport.clone(), PeerInfo::new("10.0.0.1:50000", "10.0.0.2:389"), SecurityFactors::default())
        .unwrap();
    (transport, handle)
}

pub fn limits(per_conn: usize, max_pending: usize) -> AdmissionLimits {
    AdmissionLimits { per_conn_max_executing: per_conn, max_pending, max_pending_auth: max_pending }
}

pub fn search(msgid: MessageId) -> Pdu {
    Pdu::new(msgid, RequestTag::Search, b"(objectClass=*)".to_vec())
}

pub fn search_with(msgid: MessageId, value: &[u8]) -> Pdu {
    Pdu::new(msgid, RequestTag::Search, value.to_vec())
}

pub fn bind(msgid: MessageId, dn: &str) -> Pdu {
    Pdu::new(msgid, RequestTag::Bind, dn.as_bytes().to_vec())
}

pub fn unbind(msgid: MessageId) -> Pdu {
    Pdu::new(msgid, RequestTag::Unbind, Vec::new())
}

/// A fixed list of decode results.
pub struct ScriptedSource {
    items: VecDeque<Result<Decoded, DecodeError>>,
}

impl ScriptedSource {
    pub fn new(items: Vec<Result<Decoded, DecodeError>>) -> Self {
        Self { items: items.into() }
    }
}

impl PduSource for ScriptedSource {
    fn decode_next(&mut self) -> Result<Decoded, DecodeError> {
        self.items.pop_front().unwrap_or(Ok(Decoded::WouldBlock))
    }
}

/// Check queue accounting on every live connection.
pub fn assert_accounting(d: &Dispatcher) {
    for info in d.connections() {
        let c = &info.counters;
        assert_eq!(
            (info.executing + info.pending) as u64,
            c.admitted - c.completed,
            "accounting broken on connection {}",
            info.id
        );
    }
}
