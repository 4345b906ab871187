use std::collections::HashMap;

use tracing::{debug, warn};

use super::roles::{ConnectionScope, RoleFlags};
use super::thread::ThreadRecord;
use super::transaction::{Direction, OpenTransaction, TransactionInterval};
use crate::ingest::event::{Event, OpKind, OP_KIND_COUNT};

/// Open transactions idle longer than this are expired.
pub const TRANSACTION_TIMEOUT_NS: u64 = 100_000_000;

/// Shorter expiry used while the agent is subsampling.
pub const SUBSAMPLING_TIMEOUT_NS: u64 = 5_000_000;

/// Upper bound on CPU ids accepted when the online count is unknown.
pub const MAX_CPUS: u16 = 1_024;

/// Callback invoked for one event kind after the common bookkeeping.
pub type EventCallback = fn(&mut ThreadTable, &Event);

/// Table of callbacks keyed by [`OpKind`].
#[derive(Clone)]
pub struct Dispatcher {
    callbacks: [Option<EventCallback>; OP_KIND_COUNT],
}

impl Dispatcher {
    /// Dispatcher with no callbacks registered.
    pub fn empty() -> Self {
        Self {
            callbacks: [None; OP_KIND_COUNT],
        }
    }

    /// Dispatcher wired to the built-in analysis handlers.
    pub fn standard() -> Self {
        let mut d = Self::empty();
        d.register(OpKind::Read, handle_read);
        d.register(OpKind::Write, handle_write);
        d.register(OpKind::Connect, handle_connect);
        d.register(OpKind::Accept, handle_accept);
        d.register(OpKind::Close, handle_close);
        d.register(OpKind::Error, handle_error);
        d
    }

    /// Registers `callback` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: OpKind, callback: EventCallback) {
        self.callbacks[kind.index()] = Some(callback);
    }

    pub fn get(&self, kind: OpKind) -> Option<EventCallback> {
        self.callbacks[kind.index()]
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::standard()
    }
}

/// Per-thread analyzer state, keyed by tid.
///
/// Owned and mutated by the flush thread only.
pub struct ThreadTable {
    threads: HashMap<u32, ThreadRecord>,
    dispatcher: Dispatcher,
    next_seq: u64,
    subsampling_timeout_ns: u64,
    last_event_ts_ns: u64,
    max_cpus: u16,
    rejected_events: u64,
}

impl ThreadTable {
    pub fn new(subsampling_timeout_ns: u64) -> Self {
        Self {
            threads: HashMap::new(),
            dispatcher: Dispatcher::standard(),
            next_seq: 0,
            subsampling_timeout_ns,
            last_event_ts_ns: 0,
            max_cpus: MAX_CPUS,
            rejected_events: 0,
        }
    }

    /// Rejects events and transactions on CPU ids at or above `max_cpus`.
    pub fn with_max_cpus(mut self, max_cpus: u16) -> Self {
        self.max_cpus = max_cpus.max(1);
        self
    }

    pub fn max_cpus(&self) -> u16 {
        self.max_cpus
    }

    /// Events dropped because their CPU id was out of range.
    pub fn rejected_events(&self) -> u64 {
        self.rejected_events
    }

    fn cpu_in_range(&self, cpu: u16) -> bool {
        cpu < self.max_cpus
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Timestamp of the most recent event seen, in ns.
    pub fn last_event_ts_ns(&self) -> u64 {
        self.last_event_ts_ns
    }

    pub fn get(&self, tid: u32) -> Option<&ThreadRecord> {
        self.threads.get(&tid)
    }

    pub fn get_mut(&mut self, tid: u32) -> Option<&mut ThreadRecord> {
        self.threads.get_mut(&tid)
    }

    /// Returns the record for `tid`, creating a zeroed one if absent.
    pub fn get_or_create(&mut self, tid: u32, pid: u32) -> &mut ThreadRecord {
        self.threads.entry(tid).or_insert_with(|| {
            debug!(tid, pid, "tracking new thread");
            ThreadRecord::new(tid, pid)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThreadRecord> {
        self.threads.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ThreadRecord> {
        self.threads.values_mut()
    }

    /// Number of threads with the main-program marker.
    pub fn program_count(&self) -> usize {
        self.threads.values().filter(|r| r.is_main_thread()).count()
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn add_role(&mut self, tid: u32, role: RoleFlags, side: &'static str) {
        match self.threads.get_mut(&tid) {
            Some(record) => record.roles |= role,
            None => debug!(tid, side, "connection endpoint not tracked, skipping"),
        }
    }

    /// Records a connection issued by `client_tid` and served by `server_tid`.
    pub fn on_connect(&mut self, client_tid: u32, server_tid: u32, scope: ConnectionScope) {
        let client = scope.roles().client;
        self.add_role(client_tid, client, "client");
        self.add_role(server_tid, client.mirrored(), "server");
    }

    /// Records a connection accepted by `server_tid` from `client_tid`.
    pub fn on_accept(&mut self, server_tid: u32, client_tid: u32, scope: ConnectionScope) {
        self.on_connect(client_tid, server_tid, scope);
    }

    /// Appends a closed transaction to the thread's per-CPU lists.
    pub fn add_completed_transaction(
        &mut self,
        tid: u32,
        start_ns: u64,
        end_ns: u64,
        cpu: u16,
        direction: Direction,
        is_external: bool,
    ) {
        if !self.threads.contains_key(&tid) {
            warn!(tid, "completed transaction for untracked thread");
            return;
        }
        if !self.cpu_in_range(cpu) {
            warn!(tid, cpu, max_cpus = self.max_cpus, "transaction on unknown cpu");
            return;
        }
        let seq = self.next_seq();
        if let Some(record) = self.threads.get_mut(&tid) {
            record.metrics.record_transaction(TransactionInterval {
                start_ns,
                end_ns: end_ns.max(start_ns),
                cpu,
                direction,
                is_external,
                seq,
            });
        }
    }

    /// Opens a transaction on `tid`. An already-open transaction in the same
    /// direction is only refreshed.
    pub fn start_transaction(
        &mut self,
        tid: u32,
        start_ns: u64,
        cpu: u16,
        direction: Direction,
        is_external: bool,
    ) {
        if !self.cpu_in_range(cpu) {
            warn!(tid, cpu, max_cpus = self.max_cpus, "transaction on unknown cpu");
            return;
        }
        let Some(record) = self.threads.get_mut(&tid) else {
            warn!(tid, "transaction start for untracked thread");
            return;
        };
        if let Some(open) = record.open_transaction_mut(direction) {
            open.last_activity_ns = open.last_activity_ns.max(start_ns);
            return;
        }
        record.open_transactions.push(OpenTransaction {
            start_ns,
            last_activity_ns: start_ns,
            cpu,
            direction,
            is_external,
        });
    }

    /// Completes the oldest open transaction on `tid`. Returns false when
    /// nothing was open.
    pub fn complete_transaction(&mut self, tid: u32, end_ns: u64) -> bool {
        self.complete_open(tid, None, end_ns)
    }

    fn complete_open(&mut self, tid: u32, direction: Option<Direction>, end_ns: u64) -> bool {
        let Some(record) = self.threads.get_mut(&tid) else {
            warn!(tid, "transaction completion for untracked thread");
            return false;
        };
        let pos = record
            .open_transactions
            .iter()
            .position(|t| direction.map_or(true, |d| t.direction == d));
        let Some(pos) = pos else {
            return false;
        };
        let open = record.open_transactions.remove(pos);
        self.add_completed_transaction(
            tid,
            open.start_ns,
            end_ns,
            open.cpu,
            open.direction,
            open.is_external,
        );
        true
    }

    /// Expires open transactions older than the timeout. Returns the number
    /// of transactions dropped.
    pub fn flush_inactive_transactions(
        &mut self,
        now_ns: u64,
        timeout_ns: u64,
        subsampling: bool,
    ) -> u64 {
        let timeout_ns = if subsampling {
            timeout_ns.min(self.subsampling_timeout_ns)
        } else {
            timeout_ns
        };

        let mut expired_total = 0;
        for record in self.threads.values_mut() {
            let before = record.open_transactions.len();
            record
                .open_transactions
                .retain(|t| now_ns.saturating_sub(t.start_ns) <= timeout_ns);
            let expired = (before - record.open_transactions.len()) as u64;
            if expired > 0 {
                record.metrics.expired_transactions =
                    record.metrics.expired_transactions.saturating_add(expired);
                expired_total += expired;
            }
        }

        if expired_total > 0 {
            debug!(expired = expired_total, timeout_ns, subsampling, "expired open transactions");
        }
        expired_total
    }

    /// Flushes the thread's open transactions and removes it. A child
    /// thread's remaining metrics are folded into its program's main thread.
    pub fn on_destroy(&mut self, tid: u32) {
        if !self.threads.contains_key(&tid) {
            warn!(tid, "destroy for untracked thread");
            return;
        }

        let open = self
            .threads
            .get_mut(&tid)
            .map(|r| std::mem::take(&mut r.open_transactions))
            .unwrap_or_default();
        for t in open {
            self.add_completed_transaction(
                tid,
                t.start_ns,
                t.last_activity_ns,
                t.cpu,
                t.direction,
                t.is_external,
            );
        }

        let Some(mut record) = self.threads.remove(&tid) else {
            return;
        };
        if record.is_main_thread() {
            debug!(tid, "main thread exited");
            return;
        }
        match self.threads.get_mut(&record.program_id) {
            Some(main) if main.is_main_thread() => {
                main.metrics.absorb(&mut record.metrics);
            }
            _ => debug!(
                tid,
                program_id = record.program_id,
                "exited thread has no main thread, dropping metrics"
            ),
        }
    }

    /// Applies an event: common bookkeeping, then the registered callback.
    pub fn on_event(&mut self, event: &Event) {
        self.last_event_ts_ns = self.last_event_ts_ns.max(event.ts_ns);

        if event.kind == OpKind::Exit {
            self.on_destroy(event.tid);
            return;
        }
        if !self.cpu_in_range(event.cpu) {
            self.rejected_events = self.rejected_events.saturating_add(1);
            debug!(
                tid = event.tid,
                cpu = event.cpu,
                max_cpus = self.max_cpus,
                "event on unknown cpu, rejecting"
            );
            return;
        }

        let record = self.get_or_create(event.tid, event.pid);
        if event.duration_ns > 0 {
            record.metrics.add_cpu_time(event.cpu, event.duration_ns);
            record.last_wait_duration_ns = event.duration_ns;
            record.last_wait_end_ns = event.ts_ns;
        }
        for open in record.open_transactions.iter_mut() {
            open.last_activity_ns = open.last_activity_ns.max(event.ts_ns);
        }

        if let Some(callback) = self.dispatcher.get(event.kind) {
            callback(self, event);
        }
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new(SUBSAMPLING_TIMEOUT_NS)
    }
}

fn start_ts(event: &Event) -> u64 {
    event.ts_ns.saturating_sub(event.duration_ns)
}

fn handle_read(table: &mut ThreadTable, event: &Event) {
    if let Some(record) = table.get_mut(event.tid) {
        let io = &mut record.metrics.io;
        io.reads = io.reads.saturating_add(1);
        if event.socket {
            io.net_bytes_in = io.net_bytes_in.saturating_add(event.bytes);
        } else {
            io.file_bytes_in = io.file_bytes_in.saturating_add(event.bytes);
        }
    }
    if !event.socket {
        return;
    }
    match event.server_side {
        Some(true) => table.start_transaction(
            event.tid,
            start_ts(event),
            event.cpu,
            Direction::Inbound,
            event.is_external(),
        ),
        Some(false) => {
            table.complete_open(event.tid, Some(Direction::Outbound), event.ts_ns);
        }
        None => {}
    }
}

fn handle_write(table: &mut ThreadTable, event: &Event) {
    if let Some(record) = table.get_mut(event.tid) {
        let io = &mut record.metrics.io;
        io.writes = io.writes.saturating_add(1);
        if event.socket {
            io.net_bytes_out = io.net_bytes_out.saturating_add(event.bytes);
        } else {
            io.file_bytes_out = io.file_bytes_out.saturating_add(event.bytes);
        }
    }
    if !event.socket {
        return;
    }
    match event.server_side {
        Some(true) => {
            table.complete_open(event.tid, Some(Direction::Inbound), event.ts_ns);
        }
        Some(false) => table.start_transaction(
            event.tid,
            start_ts(event),
            event.cpu,
            Direction::Outbound,
            event.is_external(),
        ),
        None => {}
    }
}

fn handle_connect(table: &mut ThreadTable, event: &Event) {
    if let Some(record) = table.get_mut(event.tid) {
        let io = &mut record.metrics.io;
        io.connects = io.connects.saturating_add(1);
    }
    let Some(scope) = event.scope else {
        return;
    };
    match event.peer_tid {
        Some(peer) => table.on_connect(event.tid, peer, scope),
        None => table.add_role(event.tid, scope.roles().client, "client"),
    }
}

fn handle_accept(table: &mut ThreadTable, event: &Event) {
    if let Some(record) = table.get_mut(event.tid) {
        let io = &mut record.metrics.io;
        io.accepts = io.accepts.saturating_add(1);
        if let Some(len) = event.queue_len {
            record.connection_queue_len = len;
        }
    }
    let Some(scope) = event.scope else {
        return;
    };
    match event.peer_tid {
        Some(peer) => table.on_accept(event.tid, peer, scope),
        None => table.add_role(event.tid, scope.roles().server, "server"),
    }
}

fn handle_close(table: &mut ThreadTable, event: &Event) {
    if let Some(record) = table.get_mut(event.tid) {
        let io = &mut record.metrics.io;
        io.closes = io.closes.saturating_add(1);
    }
    if event.socket {
        while table.complete_open(event.tid, None, event.ts_ns) {}
    }
}

fn handle_error(table: &mut ThreadTable, event: &Event) {
    if let Some(record) = table.get_mut(event.tid) {
        record.metrics.errors = record.metrics.errors.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket_event(kind: OpKind, tid: u32, ts_ns: u64, server_side: bool) -> Event {
        let mut ev = Event::new(kind, tid, tid, ts_ns);
        ev.socket = true;
        ev.server_side = Some(server_side);
        ev
    }

    #[test]
    fn test_get_or_create_marks_main_thread() {
        let mut table = ThreadTable::default();
        assert!(table.get_or_create(100, 100).is_main_thread());
        assert!(!table.get_or_create(101, 100).is_main_thread());
        assert_eq!(table.len(), 2);
        assert_eq!(table.program_count(), 1);
    }

    #[test]
    fn test_get_or_create_keeps_owner_pid() {
        let mut table = ThreadTable::default();
        table.get_or_create(101, 100);
        let record = table.get_or_create(101, 999);
        assert_eq!(record.pid(), 100);
    }

    #[test]
    fn test_connect_sets_symmetric_roles() {
        let mut table = ThreadTable::default();
        table.get_or_create(1, 1);
        table.get_or_create(2, 2);

        table.on_connect(1, 2, ConnectionScope::LocalIpv4);

        let client = table.get(1).expect("client record").roles;
        let server = table.get(2).expect("server record").roles;
        assert!(client.contains(RoleFlags::LOCAL_IPV4_CLIENT));
        assert!(server.contains(RoleFlags::LOCAL_IPV4_SERVER));
        assert!(!client.is_server());
        assert!(!server.is_client());
    }

    #[test]
    fn test_accept_with_missing_peer_sets_only_own_side() {
        let mut table = ThreadTable::default();
        table.get_or_create(2, 2);

        table.on_accept(2, 77, ConnectionScope::Unix);

        assert!(table.get(2).expect("server").roles.contains(RoleFlags::UNIX_SERVER));
        assert!(table.get(77).is_none());
    }

    #[test]
    fn test_completed_transaction_unknown_tid_is_noop() {
        let mut table = ThreadTable::default();
        table.add_completed_transaction(5, 0, 10, 0, Direction::Inbound, false);
        assert!(table.is_empty());
    }

    #[test]
    fn test_flush_expires_only_past_timeout() {
        let timeout = 1_000;
        let mut table = ThreadTable::default();
        table.get_or_create(1, 1);
        table.get_or_create(2, 2);
        table.start_transaction(1, 0, 0, Direction::Inbound, false);
        table.start_transaction(2, 2, 0, Direction::Inbound, false);

        // now - start: thread 1 = T + 1, thread 2 = T - 1.
        let expired = table.flush_inactive_transactions(timeout + 1, timeout, false);

        assert_eq!(expired, 1);
        assert!(table.get(1).expect("t1").open_transactions().is_empty());
        assert_eq!(table.get(1).expect("t1").metrics.expired_transactions, 1);
        assert_eq!(table.get(2).expect("t2").open_transactions().len(), 1);
    }

    #[test]
    fn test_flush_uses_subsampling_timeout() {
        let mut table = ThreadTable::new(50);
        table.get_or_create(1, 1);
        table.start_transaction(1, 0, 0, Direction::Outbound, false);

        assert_eq!(table.flush_inactive_transactions(60, 1_000, false), 0);
        assert_eq!(table.flush_inactive_transactions(60, 1_000, true), 1);
    }

    #[test]
    fn test_start_and_complete_transaction() {
        let mut table = ThreadTable::default();
        table.get_or_create(1, 1);
        table.start_transaction(1, 100, 3, Direction::Inbound, true);
        table.start_transaction(1, 150, 3, Direction::Inbound, true);

        assert!(table.complete_transaction(1, 400));
        assert!(!table.complete_transaction(1, 500));

        let m = &table.get(1).expect("record").metrics;
        assert_eq!(m.transactions.server_count, 1);
        assert_eq!(m.transactions.server_time_ns, 300);
        assert_eq!(m.external_transactions.server_time_ns, 300);
        assert_eq!(m.transaction_lists.cpu(Direction::Inbound, 3).len(), 1);
    }

    #[test]
    fn test_destroy_closes_open_and_folds_into_main() {
        let mut table = ThreadTable::default();
        table.get_or_create(10, 10);
        table.get_or_create(11, 10);
        table.start_transaction(11, 100, 0, Direction::Inbound, false);
        table.on_event(&socket_event(OpKind::Error, 11, 250, true));

        table.on_destroy(11);

        assert!(table.get(11).is_none());
        let main = &table.get(10).expect("main").metrics;
        assert_eq!(main.errors, 1);
        assert_eq!(main.transactions.server_count, 1);
        assert_eq!(main.transactions.server_time_ns, 150);
    }

    #[test]
    fn test_destroy_unknown_tid_is_noop() {
        let mut table = ThreadTable::default();
        table.get_or_create(1, 1);
        table.on_destroy(2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_event_driven_server_transaction() {
        let mut table = ThreadTable::default();
        let mut read = socket_event(OpKind::Read, 1, 1_000, true);
        read.bytes = 64;
        read.duration_ns = 100;
        table.on_event(&read);
        table.on_event(&socket_event(OpKind::Write, 1, 5_000, true));

        let record = table.get(1).expect("record");
        assert!(record.open_transactions().is_empty());
        assert_eq!(record.metrics.io.net_bytes_in, 64);
        assert_eq!(record.metrics.transactions.server_count, 1);
        assert_eq!(record.metrics.transactions.server_time_ns, 4_100);
        assert_eq!(record.metrics.total_cpu_time_ns(), 100);
        assert_eq!(table.last_event_ts_ns(), 5_000);
    }

    #[test]
    fn test_event_driven_client_transaction() {
        let mut table = ThreadTable::default();
        table.on_event(&socket_event(OpKind::Write, 1, 1_000, false));
        table.on_event(&socket_event(OpKind::Read, 1, 3_000, false));

        let m = &table.get(1).expect("record").metrics;
        assert_eq!(m.transactions.client_count, 1);
        assert_eq!(m.transactions.client_time_ns, 2_000);
    }

    #[test]
    fn test_exit_event_removes_record() {
        let mut table = ThreadTable::default();
        table.on_event(&Event::new(OpKind::Read, 3, 3, 10));
        table.on_event(&Event::new(OpKind::Exit, 3, 3, 20));
        assert!(table.is_empty());
    }

    #[test]
    fn test_custom_callback_replaces_builtin() {
        fn count_as_error(table: &mut ThreadTable, event: &Event) {
            if let Some(r) = table.get_mut(event.tid) {
                r.metrics.errors += 10;
            }
        }

        let mut table = ThreadTable::default();
        table.dispatcher_mut().register(OpKind::Close, count_as_error);
        table.on_event(&Event::new(OpKind::Close, 1, 1, 10));

        let m = &table.get(1).expect("record").metrics;
        assert_eq!(m.errors, 10);
        assert_eq!(m.io.closes, 0);
    }

    #[test]
    fn test_byte_counters_saturate() {
        let mut table = ThreadTable::default();
        for ts in [10, 20] {
            let mut ev = Event::new(OpKind::Read, 4, 4, ts);
            ev.bytes = u64::MAX / 2 + 1;
            table.on_event(&ev);
        }

        let io = &table.get(4).expect("record").metrics.io;
        assert_eq!(io.file_bytes_in, u64::MAX);
        assert_eq!(io.reads, 2);
    }

    #[test]
    fn test_event_on_unknown_cpu_rejected() {
        let mut table = ThreadTable::default().with_max_cpus(4);
        let mut ev = socket_event(OpKind::Read, 1, 1_000, true);
        ev.cpu = 9;
        ev.duration_ns = 50;
        table.on_event(&ev);

        assert!(table.get(1).is_none());
        assert_eq!(table.rejected_events(), 1);

        ev.cpu = 3;
        table.on_event(&ev);
        let record = table.get(1).expect("record");
        assert_eq!(record.metrics.cpu_time_ns.len(), 4);
        assert_eq!(table.rejected_events(), 1);
    }

    #[test]
    fn test_completed_transaction_unknown_cpu_is_noop() {
        let mut table = ThreadTable::default().with_max_cpus(2);
        table.get_or_create(1, 1);
        table.add_completed_transaction(1, 10, 20, 2, Direction::Inbound, true);
        table.start_transaction(1, 30, 7, Direction::Outbound, true);

        let record = table.get(1).expect("record");
        assert!(record.metrics.transaction_lists.is_empty());
        assert!(record.open_transactions().is_empty());
    }
}
