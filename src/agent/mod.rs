pub mod flush;
pub mod transmit;

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::ingest::replay::ReplaySource;
use crate::protocol::queue::ProtocolQueue;
use crate::session::{SessionFeeder, SessionRegistry};
use crate::telemetry::LogCounters;

use self::flush::FlushLoop;
use self::transmit::{build_transport, spawn_transmitter};

/// Agent wires the event source, flush thread, outbound queue, transport
/// and health server together.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    queue: Arc<ProtocolQueue>,
    sessions: Arc<SessionRegistry>,
    logs: Arc<LogCounters>,
    cancel: CancellationToken,
    flush_thread: Option<JoinHandle<()>>,
    transmit_thread: Option<JoinHandle<u64>>,
    session_threads: Vec<JoinHandle<()>>,
}

impl Agent {
    /// Creates a new Agent. `logs` is the counter set fed by the tracing
    /// layer; its totals are reported with every sample.
    pub fn new(cfg: Config, logs: Arc<LogCounters>) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let queue = Arc::new(ProtocolQueue::new(cfg.queue.capacity));
        health.queue_capacity.set(cfg.queue.capacity as f64);

        Ok(Self {
            cfg,
            health,
            queue,
            sessions: Arc::new(SessionRegistry::new()),
            logs,
            cancel: CancellationToken::new(),
            flush_thread: None,
            transmit_thread: None,
            session_threads: Vec::new(),
        })
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    pub fn queue(&self) -> &Arc<ProtocolQueue> {
        &self.queue
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Start all components.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health server first so probes respond during startup.
        let addr = self
            .health
            .start()
            .await
            .context("starting health metrics server")?;
        info!(%addr, "health metrics server listening");

        // 2. Transport and transmit thread.
        let transport = build_transport(&self.cfg.transport).context("creating transport")?;
        info!(transport = transport.name(), "transport ready");
        self.transmit_thread = Some(spawn_transmitter(
            Arc::clone(&self.queue),
            transport,
            Arc::clone(&self.health),
        )?);

        // 3. Flush thread, optionally fed by a replay file.
        let mut flush = FlushLoop::new(
            &self.cfg,
            Arc::clone(&self.queue),
            Arc::clone(&self.health),
            Arc::clone(&self.logs),
            self.cancel.clone(),
        );
        if let Some(path) = &self.cfg.ingest.replay_path {
            let source = ReplaySource::open(path)?;
            info!(path = %path.display(), "replaying events");
            flush = flush.with_source(Box::new(source));
        } else {
            warn!("no event source configured, samples will be empty");
        }
        self.flush_thread = Some(flush.spawn()?);

        info!(
            machine_id = %self.cfg.machine_id(),
            flush_interval_ms = self.cfg.flush.interval.as_millis() as u64,
            queue_capacity = self.cfg.queue.capacity,
            "agent started"
        );

        Ok(())
    }

    /// Registers an interactive session and starts forwarding its input.
    pub fn open_session(&mut self, token: &str) -> Result<()> {
        let guard = self.sessions.register(token)?;
        let feeder = SessionFeeder::new(
            guard,
            Arc::clone(&self.queue),
            self.cfg.encoder.build(),
            self.cfg.queue.retry_interval,
            self.cancel.clone(),
        );
        self.session_threads.push(feeder.spawn()?);
        self.session_threads.retain(|h| !h.is_finished());
        Ok(())
    }

    /// Stops every component. Envelopes still queued at shutdown are
    /// discarded and counted.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal flush and session threads to stop.
        self.cancel.cancel();

        let mut threads: Vec<JoinHandle<()>> = self.session_threads.drain(..).collect();
        threads.extend(self.flush_thread.take());
        tokio::task::spawn_blocking(move || {
            for handle in threads {
                if handle.join().is_err() {
                    error!("worker thread panicked");
                }
            }
        })
        .await
        .context("joining worker threads")?;

        // No producers remain; release the transmitter.
        self.queue.close();
        if let Some(handle) = self.transmit_thread.take() {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(sent)) => info!(sent, "transmit thread stopped"),
                Ok(Err(_)) => error!("transmit thread panicked"),
                Err(e) => error!(error = %e, "joining transmit thread"),
            }
        }

        let leftover = self.queue.drain();
        if !leftover.is_empty() {
            warn!(count = leftover.len(), "discarding undelivered envelopes");
            self.health
                .samples_dropped
                .with_label_values(&["shutdown"])
                .inc_by(leftover.len() as f64);
        }

        self.health.stop().await?;
        info!("agent stopped");

        Ok(())
    }
}
