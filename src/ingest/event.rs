use serde::Deserialize;

use crate::analyzer::roles::ConnectionScope;

/// Operation kind carried by an ingested event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum OpKind {
    Read = 0,
    Write = 1,
    Connect = 2,
    Accept = 3,
    Close = 4,
    Error = 5,
    Exit = 6,
}

/// Number of distinct operation kinds.
pub const OP_KIND_COUNT: usize = 7;

impl OpKind {
    pub const ALL: [Self; OP_KIND_COUNT] = [
        Self::Read,
        Self::Write,
        Self::Connect,
        Self::Accept,
        Self::Close,
        Self::Error,
        Self::Exit,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(usize::from(v)).copied()
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Connect => "connect",
            Self::Accept => "accept",
            Self::Close => "close",
            Self::Error => "error",
            Self::Exit => "exit",
        }
    }
}

/// A single timestamped per-thread event from the capture layer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Event {
    pub kind: OpKind,
    pub tid: u32,
    pub pid: u32,
    #[serde(default)]
    pub cpu: u16,
    pub ts_ns: u64,
    /// Bytes moved by a read or write.
    #[serde(default)]
    pub bytes: u64,
    /// Time the thread spent inside the syscall.
    #[serde(default)]
    pub duration_ns: u64,
    /// True when the fd is a socket rather than a file.
    #[serde(default)]
    pub socket: bool,
    /// Socket side: `Some(true)` for the accepting side, `Some(false)` for
    /// the connecting side.
    #[serde(default)]
    pub server_side: Option<bool>,
    #[serde(default)]
    pub scope: Option<ConnectionScope>,
    /// Thread on the other end of a local connection, when known.
    #[serde(default)]
    pub peer_tid: Option<u32>,
    /// Accept backlog length reported with accept events.
    #[serde(default)]
    pub queue_len: Option<u32>,
}

impl Event {
    /// Minimal event with every optional field unset.
    pub fn new(kind: OpKind, tid: u32, pid: u32, ts_ns: u64) -> Self {
        Self {
            kind,
            tid,
            pid,
            cpu: 0,
            ts_ns,
            bytes: 0,
            duration_ns: 0,
            socket: false,
            server_side: None,
            scope: None,
            peer_tid: None,
            queue_len: None,
        }
    }

    pub fn is_external(&self) -> bool {
        self.scope.is_some_and(ConnectionScope::is_external)
    }
}
