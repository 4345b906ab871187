pub mod event;
pub mod replay;

use anyhow::Result;

use self::event::Event;

/// Result of one [`EventSource::poll`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// This many events were handed to the handler.
    Delivered(usize),
    /// The source has no more events and never will.
    Exhausted,
}

/// Supplier of per-thread events, polled from the flush thread.
pub trait EventSource: Send {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Delivers up to `max` events to `handler`.
    fn poll(&mut self, max: usize, handler: &mut dyn FnMut(&Event)) -> Result<PollStatus>;

    /// Number of records that could not be decoded so far.
    fn malformed(&self) -> u64 {
        0
    }
}
