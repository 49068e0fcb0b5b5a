//! Request-path throughput benchmarks.
//!
//! Measures operation pool recycling, the admission decision, and a full
//! receive-execute-complete round trip through the dispatcher.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use ldap_core::connection::ConnState;
use ldap_core::operation::{OpPoolConfig, OperationPool};
use ldap_core::protocol::{MessageId, Pdu, RequestTag, TransportHandle};
use ldap_core::scheduler::admission::decide;
use ldap_core::scheduler::AdmissionInput;
use ldap_core::transport::{LdapResult, PeerInfo, ResponseEncoder, SecurityFactors, Transport};
use ldap_core::{CoreConfig, Dispatcher, HandlerOutcome, OpContext, OperationHandler, ResultCode};

struct DiscardTransport(TransportHandle);

impl Transport for DiscardTransport {
    fn handle(&self) -> TransportHandle {
        self.0
    }
    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }
    fn stop_reading(&self) {}
    fn close(&self) {}
}

struct FixedEncoder;

impl ResponseEncoder for FixedEncoder {
    fn encode_result(&self, _msgid: MessageId, _tag: u8, _result: &LdapResult) -> Vec<u8> {
        vec![0x30, 0x0c]
    }
    fn encode_entry(&self, _msgid: MessageId, entry: &[u8]) -> Vec<u8> {
        entry.to_vec()
    }
    fn encode_disconnect(&self, _result: &LdapResult) -> Vec<u8> {
        vec![0x30, 0x24]
    }
}

#[derive(Default)]
struct CountingHandler {
    done: AtomicU64,
}

impl OperationHandler for CountingHandler {
    fn handle(&self, ctx: &mut OpContext<'_>) -> HandlerOutcome {
        let _ = ctx.send_result(ResultCode::Success, "");
        self.done.fetch_add(1, Ordering::Release);
        HandlerOutcome::Done
    }
}

fn bench_op_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("op_pool");
    group.throughput(Throughput::Elements(1));

    let pool = OperationPool::new(OpPoolConfig::default());
    group.bench_function("acquire_release_warm", |b| {
        let mut opid = 0;
        b.iter(|| {
            opid += 1;
            let op = pool.acquire(1, opid, Pdu::new(1, RequestTag::Search, b"(cn=*)".to_vec()));
            pool.release(black_box(op));
        })
    });

    let cold = OperationPool::new(OpPoolConfig { max_free: 0, ..OpPoolConfig::default() });
    group.bench_function("acquire_release_cold", |b| {
        b.iter(|| {
            let op = cold.acquire(1, 1, Pdu::new(1, RequestTag::Search, b"(cn=*)".to_vec()));
            cold.release(black_box(op));
        })
    });

    group.finish();
}

fn bench_decide(c: &mut Criterion) {
    let mut group = c.benchmark_group("admission_decide");
    let cases = [
        ("execute", ConnState::Active, false, 0, 0),
        ("write_blocked", ConnState::Active, true, 1, 0),
        ("over_cap", ConnState::Active, false, 4, 3),
        ("binding", ConnState::Binding, false, 1, 0),
    ];
    for (name, state, writewaiter, executing, pending) in cases {
        let input = AdmissionInput { state, writewaiter, executing, pending, tag: RequestTag::Search };
        group.bench_with_input(BenchmarkId::from_parameter(name), &input, |b, input| {
            b.iter(|| decide(black_box(input), 4))
        });
    }
    group.finish();
}

fn bench_dispatch_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_round_trip");
    group.measurement_time(Duration::from_secs(5));

    for connections in [1u64, 8] {
        let config = CoreConfig { worker_threads: 4, max_pending: 10_000, ..CoreConfig::default() };
        let handler = Arc::new(CountingHandler::default());
        let d = Dispatcher::new(&config, handler.clone(), Arc::new(FixedEncoder)).unwrap();
        for th in 0..connections {
            d.accept(Arc::new(DiscardTransport(th)), PeerInfo::default(), SecurityFactors::default())
                .unwrap();
        }

        group.throughput(Throughput::Elements(connections));
        group.bench_function(BenchmarkId::new("search", connections), |b| {
            let mut msgid: MessageId = 0;
            b.iter_custom(|iters| {
                let mut target = handler.done.load(Ordering::Acquire);
                let start = Instant::now();
                for _ in 0..iters {
                    msgid = msgid.wrapping_add(1).max(1);
                    for th in 0..connections {
                        let pdu = Pdu::new(msgid, RequestTag::Search, b"(cn=*)".to_vec());
                        // Busy rejections never reach the handler.
                        if d.receive(th, pdu).is_ok() {
                            target += 1;
                        }
                    }
                }
                while handler.done.load(Ordering::Acquire) < target {
                    std::thread::yield_now();
                }
                start.elapsed()
            })
        });
        d.shutdown(Duration::from_secs(5));
    }

    group.finish();
}

criterion_group!(benches, bench_op_pool, bench_decide, bench_dispatch_round_trip);
criterion_main!(benches);
