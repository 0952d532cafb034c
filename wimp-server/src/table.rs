//! Process table: declared peers by name, their address, relation and outbound connection.
//!
//! Connections arrive from the accept loop, possibly before the peer is declared;
//! those are parked as pending and claimed by `add`.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use tokio::net::TcpStream;
use wimp_core::protocol::is_valid_name;
use wimp_core::Relation;

/// Most connections parked for undeclared names at once; later ones are refused.
pub const MAX_PENDING: usize = 64;

/// One declared peer.
#[derive(Debug)]
pub struct ProcessEntry {
    pub name: String,
    pub domain: String,
    pub port: u16,
    pub addr: SocketAddr,
    pub relation: Relation,
    /// Outbound connection (accepted from the peer's receiver). At most one at a time.
    pub connection: Option<TcpStream>,
}

impl ProcessEntry {
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

/// Error from process table operations.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("process {0:?} already registered")]
    DuplicateName(String),
    #[error("invalid process name {0:?}")]
    InvalidName(String),
    #[error("invalid address {domain}:{port}")]
    InvalidAddress { domain: String, port: u16 },
    #[error("process {0:?} not found")]
    NotFound(String),
}

/// Outcome of handing an accepted connection to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    /// Bound to a declared entry.
    Attached,
    /// Bound to a declared entry, replacing an older connection.
    Replaced,
    /// Name not declared yet; parked until `add`.
    Pending,
    /// Table is closed, or too many connections are parked; connection dropped.
    Refused,
}

#[derive(Debug, Default)]
pub struct ProcessTable {
    entries: BTreeMap<String, ProcessEntry>,
    pending: HashMap<String, TcpStream>,
    closed: bool,
}

/// Resolve a peer address without blocking the runtime. First result wins.
pub async fn resolve(domain: &str, port: u16) -> Result<SocketAddr, TableError> {
    tokio::net::lookup_host((domain, port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| TableError::InvalidAddress {
            domain: domain.to_string(),
            port,
        })
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer at an address already [`resolve`]d from `domain:port`.
    /// Claims a pending connection with the same name, if any.
    pub fn add(
        &mut self,
        name: &str,
        domain: &str,
        port: u16,
        addr: SocketAddr,
        relation: Relation,
    ) -> Result<&ProcessEntry, TableError> {
        if !is_valid_name(name) {
            return Err(TableError::InvalidName(name.to_string()));
        }
        if self.entries.contains_key(name) {
            return Err(TableError::DuplicateName(name.to_string()));
        }
        let entry = ProcessEntry {
            name: name.to_string(),
            domain: domain.to_string(),
            port,
            addr,
            relation,
            connection: self.pending.remove(name),
        };
        Ok(self.entries.entry(name.to_string()).or_insert(entry))
    }

    pub fn lookup(&self, name: &str) -> Result<&ProcessEntry, TableError> {
        self.entries
            .get(name)
            .ok_or_else(|| TableError::NotFound(name.to_string()))
    }

    pub fn lookup_mut(&mut self, name: &str) -> Result<&mut ProcessEntry, TableError> {
        self.entries
            .get_mut(name)
            .ok_or_else(|| TableError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Deregister a peer, dropping its connection.
    pub fn remove(&mut self, name: &str) -> Result<ProcessEntry, TableError> {
        self.entries
            .remove(name)
            .ok_or_else(|| TableError::NotFound(name.to_string()))
    }

    /// Bind an accepted connection to `name`.
    pub fn attach(&mut self, name: &str, stream: TcpStream) -> Attach {
        if self.closed {
            return Attach::Refused;
        }
        match self.entries.get_mut(name) {
            Some(entry) => match entry.connection.replace(stream) {
                Some(_) => Attach::Replaced,
                None => Attach::Attached,
            },
            None if self.pending.len() >= MAX_PENDING && !self.pending.contains_key(name) => {
                Attach::Refused
            }
            None => {
                self.pending.insert(name.to_string(), stream);
                Attach::Pending
            }
        }
    }

    /// Names of connections that arrived for peers nobody declared.
    pub fn pending_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pending.keys().cloned().collect();
        names.sort();
        names
    }

    /// Close the parked connection for `name`. False if none was parked.
    pub fn drop_pending(&mut self, name: &str) -> bool {
        self.pending.remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry and connection; later attaches are refused.
    pub fn close(&mut self) {
        self.entries.clear();
        self.pending.clear();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
