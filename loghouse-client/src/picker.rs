//! Call routing over the resolved server set.

/// One resolved server, as reported by `GetServers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: u64,
    pub rpc_addr: String,
    pub is_leader: bool,
}

/// Picks a server per call: the leader for produce, rotating followers for
/// consume. With a single node the leader serves both.
#[derive(Debug, Default)]
pub struct Picker {
    servers: Vec<ServerInfo>,
    next_follower: usize,
}

impl Picker {
    /// Replaces the server set with a fresh resolution.
    pub fn update(&mut self, servers: Vec<ServerInfo>) {
        self.servers = servers;
    }

    /// Whether any servers have been resolved.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// The resolved server set.
    pub fn servers(&self) -> &[ServerInfo] {
        &self.servers
    }

    /// The current leader, for produce calls.
    pub fn pick_leader(&self) -> Option<ServerInfo> {
        self.servers.iter().find(|s| s.is_leader).cloned()
    }

    /// The next follower in rotation, for consume calls. Falls back to the
    /// leader when it is the only member.
    pub fn pick_follower(&mut self) -> Option<ServerInfo> {
        let followers: Vec<&ServerInfo> =
            self.servers.iter().filter(|s| !s.is_leader).collect();
        if followers.is_empty() {
            return self.pick_leader();
        }
        let picked = followers[self.next_follower % followers.len()].clone();
        self.next_follower = self.next_follower.wrapping_add(1);
        Some(picked)
    }
}
