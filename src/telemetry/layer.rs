use std::sync::Arc;

use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::{LogCounters, Severity};

/// Tracing layer that counts every emitted event by severity.
#[derive(Debug, Clone)]
pub struct SeverityCountingLayer {
    counters: Arc<LogCounters>,
}

impl SeverityCountingLayer {
    pub fn new(counters: Arc<LogCounters>) -> Self {
        Self { counters }
    }
}

impl<S: Subscriber> Layer<S> for SeverityCountingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        self.counters
            .notify(Severity::from_level(event.metadata().level()));
    }
}
