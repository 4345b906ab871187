use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hostwatch::analyzer::delays::merge_intervals;
use hostwatch::analyzer::table::ThreadTable;
use hostwatch::analyzer::transaction::{Direction, TransactionInterval};
use hostwatch::ingest::event::{Event, OpKind};
use hostwatch::protocol::compress::Compression;
use hostwatch::protocol::envelope::{MessageEnvelope, MessageType};
use hostwatch::protocol::queue::{Priority, ProtocolQueue};

fn intervals(n: u64) -> Vec<TransactionInterval> {
    (0..n)
        .map(|i| {
            // Pseudo-random but deterministic starts with frequent overlap.
            let start = (i * 7_919) % (n * 100);
            TransactionInterval {
                start_ns: start,
                end_ns: start + 250,
                cpu: 0,
                direction: Direction::Inbound,
                is_external: i % 3 == 0,
                seq: i,
            }
        })
        .collect()
}

fn socket_events(threads: u32, per_thread: u64) -> Vec<Event> {
    let mut events = Vec::with_capacity((u64::from(threads) * per_thread * 2) as usize);
    for i in 0..per_thread {
        for t in 0..threads {
            let tid = 1_000 + t;
            let ts = i * 10_000 + u64::from(t);
            for (kind, offset) in [(OpKind::Read, 0), (OpKind::Write, 5_000)] {
                let mut ev = Event::new(kind, tid, 1_000, ts + offset);
                ev.cpu = (t % 4) as u16;
                ev.bytes = 256;
                ev.duration_ns = 1_500;
                ev.socket = true;
                ev.server_side = Some(true);
                events.push(ev);
            }
        }
    }
    events
}

fn bench_merge_intervals(c: &mut Criterion) {
    let input = intervals(4_096);

    c.bench_function("delays/merge_4096", |b| {
        b.iter(|| {
            let mut work = input.clone();
            black_box(merge_intervals(black_box(&mut work)).len())
        })
    });
}

fn bench_table(c: &mut Criterion) {
    let events = socket_events(16, 256);

    c.bench_function("table/on_event_socket_pairs", |b| {
        b.iter(|| {
            let mut table = ThreadTable::default();
            for ev in &events {
                table.on_event(black_box(ev));
            }
            black_box(table.len())
        })
    });
}

fn bench_queue(c: &mut Criterion) {
    let queue = ProtocolQueue::new(1_024);
    let envelope = MessageEnvelope {
        message_type: MessageType::Metrics,
        timestamp_ns: 1,
        compression: Compression::None,
        payload: vec![0u8; 512],
    };

    c.bench_function("queue/put_get_mixed_priority", |b| {
        b.iter(|| {
            for prio in [Priority::Low, Priority::High, Priority::Medium] {
                queue.put(envelope.clone(), prio).expect("put");
            }
            for _ in 0..3 {
                black_box(queue.get().expect("get"));
            }
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_merge_intervals(c);
    bench_table(c);
    bench_queue(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
