use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use hostwatch::agent::flush::FlushLoop;
use hostwatch::config::Config;
use hostwatch::export::health::HealthMetrics;
use hostwatch::ingest::replay::ReplaySource;
use hostwatch::protocol::compress::{decompress, Compression};
use hostwatch::protocol::envelope::{MessageEnvelope, MessageType};
use hostwatch::protocol::queue::{Priority, ProtocolQueue};
use hostwatch::session::{PendingMessage, SessionFeeder, SessionRegistry};
use hostwatch::telemetry::LogCounters;

const MS: u64 = 1_000_000;

fn write_replay(lines: &[String]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    for line in lines {
        writeln!(file, "{line}").expect("write line");
    }
    file.flush().expect("flush");
    file
}

fn socket(kind: &str, tid: u32, pid: u32, ts_ns: u64, server_side: bool) -> String {
    format!(
        r#"{{"kind":"{kind}","tid":{tid},"pid":{pid},"cpu":0,"ts_ns":{ts_ns},"bytes":512,"socket":true,"server_side":{server_side},"scope":"remote_ipv4"}}"#
    )
}

fn pipeline_config() -> Config {
    let mut cfg = Config::default();
    cfg.machine_id = "pipeline".to_string();
    cfg.telemetry.sample_processes = false;
    cfg.encoder.compression = Compression::Gzip;
    cfg
}

fn payload_json(envelope: &MessageEnvelope) -> serde_json::Value {
    let raw = decompress(&envelope.payload, envelope.compression).expect("decompress");
    serde_json::from_slice(&raw).expect("json payload")
}

#[test]
fn test_replay_to_queue_merges_overlapping_transactions() {
    // Two threads of program 100 serve overlapping requests on CPU 0:
    // [1ms, 51ms] and [31ms, 81ms] merge into 80ms of inbound busy time.
    let replay = write_replay(&[
        r#"{"kind":"accept","tid":100,"pid":100,"ts_ns":500000,"scope":"remote_ipv4","queue_len":64}"#
            .to_string(),
        socket("read", 100, 100, MS, true),
        socket("read", 101, 100, 31 * MS, true),
        "garbage".to_string(),
        socket("write", 100, 100, 51 * MS, true),
        socket("write", 101, 100, 81 * MS, true),
        r#"{"kind":"read","tid":200,"pid":200,"ts_ns":90000000,"bytes":4096}"#.to_string(),
    ]);

    let cfg = pipeline_config();
    let queue = Arc::new(ProtocolQueue::new(8));
    let health = Arc::new(HealthMetrics::new("127.0.0.1:0").expect("health"));
    let source = ReplaySource::open(replay.path()).expect("open replay");
    let mut flush = FlushLoop::new(
        &cfg,
        Arc::clone(&queue),
        Arc::clone(&health),
        Arc::new(LogCounters::new()),
        CancellationToken::new(),
    )
    .with_source(Box::new(source));

    while flush.poll_source() > 0 {}
    let report = flush.flush();
    assert_eq!(report.processes, 2);
    assert_eq!(report.threads, 3);
    assert_eq!(report.expired_transactions, 0);
    assert!(report.enqueued);

    let item = queue.get_timeout(Duration::from_millis(10)).expect("sample");
    assert_eq!(item.priority, Priority::Medium);

    // The frame survives the wire format unchanged.
    let frame = item.envelope.to_bytes().expect("frame");
    let envelope = MessageEnvelope::from_bytes(&frame).expect("decode frame");
    assert_eq!(envelope.message_type, MessageType::Metrics);
    assert_eq!(envelope.compression, Compression::Gzip);

    let sample = payload_json(&envelope);
    assert_eq!(sample["machine_id"], "pipeline");
    let processes = sample["processes"].as_array().expect("processes");
    assert_eq!(processes.len(), 2);

    let server = &processes[0];
    assert_eq!(server["pid"], 100);
    assert_eq!(server["n_threads"], 2);
    assert_eq!(server["n_transaction_threads"], 2);
    assert_eq!(server["transactions"]["server_count"], 2);
    assert_eq!(server["delays"]["merged_inbound_delay_ns"], 80 * MS);
    assert_eq!(server["delays"]["local_processing_delay_ns"], 80 * MS);
    assert_eq!(server["delays"]["local_remote_ratio"], 1.0);
    assert_eq!(server["connection_queue_usage_pct"], 50);
    assert_eq!(server["io"]["net_bytes_in"], 1024);
    assert_eq!(server["roles"][0], "ipv4_remote_server");

    let reader = &processes[1];
    assert_eq!(reader["pid"], 200);
    assert_eq!(reader["io"]["file_bytes_in"], 4096);
    assert!(reader["delays"]["local_remote_ratio"].is_null());

    assert_eq!(sample["telemetry"]["counters"]["events"], 6);
    assert_eq!(sample["telemetry"]["counters"]["malformed_events"], 1);
    assert_eq!(health.events_malformed.get(), 1.0);
}

#[test]
fn test_session_data_overtakes_metrics() {
    let cfg = pipeline_config();
    let queue = Arc::new(ProtocolQueue::new(8));
    let health = Arc::new(HealthMetrics::new("127.0.0.1:0").expect("health"));
    let shutdown = CancellationToken::new();

    let mut flush = FlushLoop::new(
        &cfg,
        Arc::clone(&queue),
        health,
        Arc::new(LogCounters::new()),
        shutdown.clone(),
    );
    assert!(flush.flush().enqueued);

    let registry = Arc::new(SessionRegistry::new());
    let guard = registry.register("tok").expect("register");
    registry.push_input(
        "tok",
        PendingMessage {
            input: b"ls\n".to_vec(),
            close: true,
        },
    );
    let feeder = SessionFeeder::new(
        guard,
        Arc::clone(&queue),
        cfg.encoder.build(),
        Duration::from_millis(5),
        shutdown,
    );
    assert!(!feeder.pump());

    let first = queue.get_timeout(Duration::from_millis(10)).expect("first");
    assert_eq!(first.envelope.message_type, MessageType::SessionData);
    assert_eq!(first.priority, Priority::High);
    let data = payload_json(&first.envelope);
    assert_eq!(data["token"], "tok");
    assert_eq!(data["closed"], true);

    let second = queue.get_timeout(Duration::from_millis(10)).expect("second");
    assert_eq!(second.envelope.message_type, MessageType::Metrics);

    drop(feeder);
    assert!(!registry.contains("tok"));
}
