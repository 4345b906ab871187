//! Token-keyed interactive session bookkeeping and the feeder that ships
//! session traffic through the outbound queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::encoder::{now_ns, SampleEncoder};
use crate::protocol::envelope::MessageType;
use crate::protocol::queue::{ProtocolQueue, PutPolicy};

/// Input received for a session and not yet forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub input: Vec<u8>,
    /// The remote side asked to end the session.
    pub close: bool,
}

/// Open sessions and their pending input.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, VecDeque<PendingMessage>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session. The returned guard removes it when dropped.
    pub fn register(self: &Arc<Self>, token: &str) -> Result<SessionGuard> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(token) {
            bail!("session {token} is already open");
        }
        sessions.insert(token.to_string(), VecDeque::new());
        debug!(token, "session opened");

        Ok(SessionGuard {
            registry: Arc::clone(self),
            token: token.to_string(),
        })
    }

    /// Queues input for a session. Unknown tokens are logged and ignored.
    pub fn push_input(&self, token: &str, message: PendingMessage) -> bool {
        match self.sessions.lock().get_mut(token) {
            Some(pending) => {
                pending.push_back(message);
                true
            }
            None => {
                warn!(token, "input for unknown session");
                false
            }
        }
    }

    /// Takes everything queued for `token`, or `None` when it is not open.
    pub fn take_pending(&self, token: &str) -> Option<Vec<PendingMessage>> {
        self.sessions
            .lock()
            .get_mut(token)
            .map(|pending| pending.drain(..).collect())
    }

    pub fn contains(&self, token: &str) -> bool {
        self.sessions.lock().contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, token: &str) {
        if self.sessions.lock().remove(token).is_some() {
            debug!(token, "session closed");
        }
    }
}

/// Keeps a session registered for as long as it is alive.
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    token: String,
}

impl SessionGuard {
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.token);
    }
}

#[derive(Debug, Serialize)]
struct SessionData<'a> {
    token: &'a str,
    data: String,
    closed: bool,
}

/// Forwards a session's pending input to the queue at high priority,
/// retrying while the queue is full until shutdown.
pub struct SessionFeeder {
    guard: SessionGuard,
    queue: Arc<ProtocolQueue>,
    encoder: SampleEncoder,
    retry_interval: Duration,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl SessionFeeder {
    pub fn new(
        guard: SessionGuard,
        queue: Arc<ProtocolQueue>,
        encoder: SampleEncoder,
        retry_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            guard,
            queue,
            encoder,
            retry_interval,
            poll_interval: Duration::from_millis(100),
            shutdown,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Forwards queued input once. Returns false when the session has ended.
    pub fn pump(&self) -> bool {
        let token = self.guard.token();
        let Some(pending) = self.guard.registry.take_pending(token) else {
            return false;
        };

        let mut open = true;
        for message in pending {
            let data = SessionData {
                token,
                data: String::from_utf8_lossy(&message.input).into_owned(),
                closed: message.close,
            };
            if let Some(envelope) = self.encoder.encode(MessageType::SessionData, now_ns(), &data) {
                let policy = PutPolicy::RetryUntilShutdown {
                    interval: self.retry_interval,
                };
                if let Err(e) = self.queue.put_with_policy(
                    envelope,
                    MessageType::SessionData.default_priority(),
                    policy,
                    &self.shutdown,
                ) {
                    warn!(token, error = %e, "session data not enqueued");
                    return false;
                }
            }
            if message.close {
                open = false;
                break;
            }
        }
        open
    }

    /// Runs until the session closes or shutdown is signalled. The session
    /// is unregistered on every exit path.
    pub fn run(self) {
        info!(token = self.guard.token(), "session feeder started");
        while !self.shutdown.is_cancelled() && self.pump() {
            std::thread::sleep(self.poll_interval);
        }
        info!(token = self.guard.token(), "session feeder stopped");
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("session-{}", self.guard.token()))
            .spawn(move || self.run())
            .context("spawning session feeder thread")
    }
}
