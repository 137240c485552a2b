//! Link registry
//!
//! One entry per configured gateway, in configuration order. Each entry
//! holds the link's live connection handle (absent while reconnecting) and
//! the destinations it has carried. Learned destinations are append-only.

use std::fmt;
use std::sync::Arc;

use ahash::AHashSet;
use parking_lot::Mutex;

use super::router;
use crate::knx::{BusSender, GroupAddr};

/// Index of a link in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(usize);

impl LinkId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Default)]
struct LinkEntry {
    handle: Option<Arc<dyn BusSender>>,
    observed: Vec<GroupAddr>,
    seen: AHashSet<GroupAddr>,
}

/// Routing decision for an outbound telegram
#[derive(Clone)]
pub struct Route {
    pub link: LinkId,
    pub name: String,
    /// `None` while the link is reconnecting
    pub handle: Option<Arc<dyn BusSender>>,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("link", &self.link)
            .field("name", &self.name)
            .field("connected", &self.handle.is_some())
            .finish()
    }
}

/// Point-in-time view of one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub name: String,
    pub connected: bool,
    pub observed: Vec<GroupAddr>,
}

pub struct LinkRegistry {
    names: Vec<String>,
    entries: Mutex<Vec<LinkEntry>>,
    min_prefix_bits: u8,
}

impl LinkRegistry {
    pub fn new<I, S>(names: I, min_prefix_bits: u8) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let entries = names.iter().map(|_| LinkEntry::default()).collect();
        Self {
            names,
            entries: Mutex::new(entries),
            min_prefix_bits: min_prefix_bits.min(16),
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = LinkId> {
        (0..self.names.len()).map(LinkId)
    }

    pub fn name(&self, link: LinkId) -> &str {
        &self.names[link.0]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Install the live connection handle, replacing any previous one
    pub fn attach(&self, link: LinkId, handle: Arc<dyn BusSender>) {
        self.entries.lock()[link.0].handle = Some(handle);
    }

    /// Drop the connection handle; learned destinations stay
    pub fn detach(&self, link: LinkId) {
        self.entries.lock()[link.0].handle = None;
    }

    /// Record that `link` carried traffic for `destination`
    ///
    /// Returns `true` the first time the pair is seen.
    pub fn learn(&self, link: LinkId, destination: GroupAddr) -> bool {
        let mut entries = self.entries.lock();
        let entry = &mut entries[link.0];
        if entry.seen.insert(destination) {
            entry.observed.push(destination);
            true
        } else {
            false
        }
    }

    pub fn route(&self, destination: GroupAddr) -> Option<Route> {
        let entries = self.entries.lock();
        let observed = entries.iter().map(|e| e.observed.as_slice());
        let index = router::route(observed, destination, self.min_prefix_bits)?;
        Some(Route {
            link: LinkId(index),
            name: self.names[index].clone(),
            handle: entries[index].handle.clone(),
        })
    }

    pub fn snapshot(&self) -> Vec<LinkSnapshot> {
        let entries = self.entries.lock();
        self.names
            .iter()
            .zip(entries.iter())
            .map(|(name, entry)| LinkSnapshot {
                name: name.clone(),
                connected: entry.handle.is_some(),
                observed: entry.observed.clone(),
            })
            .collect()
    }
}
