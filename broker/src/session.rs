use hashbrown::HashMap;

/// Slot index of a live connection in the endpoint's connection table.
pub type ConnId = usize;

/// Map from account name to live connection. Owned by the protocol engine
/// and mutated only on the server loop thread, so no locking is needed.
pub struct SessionTable {
    map: HashMap<String, ConnId>,
}

impl SessionTable {
    pub fn new() -> SessionTable {
        SessionTable { map: HashMap::new() }
    }

    /// Associates a login with a connection. A login is bound at most once;
    /// the engine refuses duplicate presences before calling this.
    pub fn bind(&mut self, login: &str, conn: ConnId) {
        self.map.insert(login.to_owned(), conn);
    }

    pub fn unbind(&mut self, login: &str) -> Option<ConnId> {
        self.map.remove(login)
    }

    pub fn lookup(&self, login: &str) -> Option<ConnId> {
        self.map.get(login).copied()
    }

    pub fn contains(&self, login: &str) -> bool {
        self.map.contains_key(login)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
