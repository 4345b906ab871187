//! Per-thread state tracking, per-program roll-ups and delay computation.
//!
//! Everything here runs on the flush thread; nothing is shared.

pub mod delays;
pub mod process;
pub mod roles;
pub mod table;
pub mod thread;
pub mod transaction;

pub use delays::{compute_program_delays, DelayInfo, LocalRemoteRatio};
pub use process::{ProcessAggregate, ProcessAggregateBuilder, UsageLimits};
pub use roles::{ConnectionScope, RoleFlags};
pub use table::ThreadTable;
pub use thread::ThreadRecord;
pub use transaction::{Direction, TransactionInterval};
