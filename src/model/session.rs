//! Relay-side session membership
//!
//! A session groups the endpoints that share a caller-supplied identifier.
//! Sessions live only in memory and disappear with their last member.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

/// Identifies one WebSocket connection to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(u64);

impl EndpointId {
    /// Allocates the next process-unique id.
    pub fn next() -> EndpointId {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(0);
        EndpointId(ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Deref for EndpointId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque session identifier chosen by the caller.
pub type SessionId = String;

/// A session and the outbound handles of its members, in join order.
#[derive(Debug)]
pub struct Session<T> {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    members: Vec<(EndpointId, T)>,
}

impl<T> Session<T> {
    pub fn new(id: SessionId) -> Session<T> {
        Session {
            id,
            created_at: Utc::now(),
            members: Vec::with_capacity(2),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, endpoint: EndpointId) -> bool {
        self.members.iter().any(|(id, _)| *id == endpoint)
    }

    pub fn insert(&mut self, endpoint: EndpointId, outbound: T) {
        self.members.push((endpoint, outbound));
    }

    pub fn remove(&mut self, endpoint: EndpointId) -> Option<T> {
        let pos = self.members.iter().position(|(id, _)| *id == endpoint)?;
        Some(self.members.remove(pos).1)
    }

    pub fn members(&self) -> impl Iterator<Item = (EndpointId, &T)> {
        self.members.iter().map(|(id, t)| (*id, t))
    }

    /// Members other than `endpoint`.
    pub fn others(&self, endpoint: EndpointId) -> impl Iterator<Item = (EndpointId, &T)> {
        self.members
            .iter()
            .filter(move |(id, _)| *id != endpoint)
            .map(|(id, t)| (*id, t))
    }

    /// How long the session has existed.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}
