//! Message envelopes, payload encoding and the outbound priority queue.

pub mod buffer;
pub mod compress;
pub mod encoder;
pub mod envelope;
pub mod queue;
pub mod sample;

pub use compress::Compression;
pub use encoder::{EncodeError, SampleEncoder};
pub use envelope::{MessageEnvelope, MessageType};
pub use queue::{Priority, ProtocolQueue, PutPolicy, QueueError, QueueItem};
