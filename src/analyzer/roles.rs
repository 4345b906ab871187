use bitflags::bitflags;
use serde::Deserialize;

bitflags! {
    /// Analysis flags attached to a thread record.
    ///
    /// The networking bits describe roles observed on connection
    /// establishment. They are always set in client/server pairs through
    /// [`ConnectionScope::roles`] so both endpoints agree.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RoleFlags: u16 {
        /// Serves IPv4 transactions coming from the same machine.
        const LOCAL_IPV4_SERVER = 1 << 0;
        /// Serves IPv4 transactions coming from another machine.
        const REMOTE_IPV4_SERVER = 1 << 1;
        /// Serves unix-domain transactions.
        const UNIX_SERVER = 1 << 2;
        /// Issues IPv4 transactions toward localhost.
        const LOCAL_IPV4_CLIENT = 1 << 3;
        /// Issues IPv4 transactions toward another host.
        const REMOTE_IPV4_CLIENT = 1 << 4;
        /// Issues unix-domain transactions.
        const UNIX_CLIENT = 1 << 5;
        /// Main thread of a program; aggregates are rooted here.
        const MAIN_PROGRAM_THREAD = 1 << 6;

        const SERVER = Self::LOCAL_IPV4_SERVER.bits()
            | Self::REMOTE_IPV4_SERVER.bits()
            | Self::UNIX_SERVER.bits();
        const CLIENT = Self::LOCAL_IPV4_CLIENT.bits()
            | Self::REMOTE_IPV4_CLIENT.bits()
            | Self::UNIX_CLIENT.bits();
        const NETWORK_ROLES = Self::SERVER.bits() | Self::CLIENT.bits();
    }
}

impl RoleFlags {
    pub fn is_main_program_thread(self) -> bool {
        self.contains(Self::MAIN_PROGRAM_THREAD)
    }

    pub fn set_main_program_thread(&mut self, value: bool) {
        self.set(Self::MAIN_PROGRAM_THREAD, value);
    }

    pub fn is_server(self) -> bool {
        self.intersects(Self::SERVER)
    }

    pub fn is_client(self) -> bool {
        self.intersects(Self::CLIENT)
    }

    /// Returns the networking roles mirrored across the connection: each
    /// client bit becomes the matching server bit and vice versa.
    pub fn mirrored(self) -> Self {
        let mut out = Self::empty();
        for scope in ConnectionScope::ALL {
            let pair = scope.roles();
            if self.contains(pair.client) {
                out |= pair.server;
            }
            if self.contains(pair.server) {
                out |= pair.client;
            }
        }
        out
    }

    /// Short label set for logs and samples, e.g. `["ipv4_local_server"]`.
    pub fn labels(self) -> Vec<&'static str> {
        let mut out = Vec::new();
        for (name, flag) in [
            ("ipv4_local_server", Self::LOCAL_IPV4_SERVER),
            ("ipv4_remote_server", Self::REMOTE_IPV4_SERVER),
            ("unix_server", Self::UNIX_SERVER),
            ("ipv4_local_client", Self::LOCAL_IPV4_CLIENT),
            ("ipv4_remote_client", Self::REMOTE_IPV4_CLIENT),
            ("unix_client", Self::UNIX_CLIENT),
        ] {
            if self.contains(flag) {
                out.push(name);
            }
        }
        out
    }
}

/// Where the two endpoints of a connection live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionScope {
    /// IPv4 connection where both endpoints are on this host.
    LocalIpv4,
    /// IPv4 connection crossing the host boundary.
    RemoteIpv4,
    /// Unix-domain socket connection.
    Unix,
}

/// The pair of flags a connection assigns to its two endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRoles {
    pub client: RoleFlags,
    pub server: RoleFlags,
}

impl ConnectionScope {
    pub const ALL: [Self; 3] = [Self::LocalIpv4, Self::RemoteIpv4, Self::Unix];

    pub const fn roles(self) -> ConnectionRoles {
        match self {
            Self::LocalIpv4 => ConnectionRoles {
                client: RoleFlags::LOCAL_IPV4_CLIENT,
                server: RoleFlags::LOCAL_IPV4_SERVER,
            },
            Self::RemoteIpv4 => ConnectionRoles {
                client: RoleFlags::REMOTE_IPV4_CLIENT,
                server: RoleFlags::REMOTE_IPV4_SERVER,
            },
            Self::Unix => ConnectionRoles {
                client: RoleFlags::UNIX_CLIENT,
                server: RoleFlags::UNIX_SERVER,
            },
        }
    }

    /// True when the peer lives on another machine.
    pub const fn is_external(self) -> bool {
        matches!(self, Self::RemoteIpv4)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalIpv4 => "local_ipv4",
            Self::RemoteIpv4 => "remote_ipv4",
            Self::Unix => "unix",
        }
    }
}
