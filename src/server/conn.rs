//! fd <-> client association. Replaces the reference server's intrusive
//! linked list of connections with an owned map — same externally visible
//! behaviour, no hand-rolled list bookkeeping.

use std::collections::HashMap;

use crate::jobs::ClientId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ConnId(pub usize);

#[derive(Default)]
pub struct ConnEntry {
    pub bound_client: Option<ClientId>,
}

pub struct ConnTable {
    next_id: usize,
    entries: HashMap<ConnId, ConnEntry>,
}

impl ConnTable {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: HashMap::new(),
        }
    }

    /// Registers a freshly accepted connection, not yet bound to any client.
    pub fn insert(&mut self) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        self.entries.insert(id, ConnEntry::default());
        id
    }

    pub fn bind(&mut self, conn: ConnId, client: ClientId) {
        if let Some(entry) = self.entries.get_mut(&conn) {
            entry.bound_client = Some(client);
        }
    }

    pub fn bound_client(&self, conn: ConnId) -> Option<ClientId> {
        self.entries.get(&conn).and_then(|e| e.bound_client)
    }

    /// The connection currently bound to `client`, if any — used to route
    /// JOB_UPDATE notifications to a job's owner.
    pub fn conn_for_client(&self, client: ClientId) -> Option<ConnId> {
        self.entries
            .iter()
            .find(|(_, e)| e.bound_client == Some(client))
            .map(|(&id, _)| id)
    }

    /// Removes a connection's bookkeeping; does not touch the client record.
    pub fn remove(&mut self, conn: ConnId) {
        self.entries.remove(&conn);
    }

    pub fn ids(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.entries.keys().copied()
    }
}
