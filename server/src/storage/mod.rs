use crate::catalog::Segment;
use crate::errors::ServerError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use transcoder::HlsLayout;

pub mod local;
pub mod offload;
pub mod remote;

/// Where a segment's bytes live. Keys are `<rendition>/<file name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    Local(String),
    Remote(String),
}

impl Locator {
    pub fn key(&self) -> &str {
        match self {
            Locator::Local(key) | Locator::Remote(key) => key,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Locator::Remote(_))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Local(key) => write!(f, "local:{}", key),
            Locator::Remote(key) => write!(f, "remote:{}", key),
        }
    }
}

pub fn segment_key(rendition: &str, file_name: &str) -> String {
    format!("{}/{}", rendition, file_name)
}

/// Backend that evicted segments are handed to.
///
/// `offload` must be idempotent: offloading the same segment twice, even
/// concurrently, yields the same locator and at most one physical copy.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn offload(&self, segment: &Segment) -> Result<Locator, ServerError>;

    /// Best effort. Failures are logged, never returned.
    async fn purge(&self, locator: &Locator);

    fn resolve_serving_url(&self, locator: &Locator) -> String;
}

/// Locators of segments that left the serving window but were kept, so a
/// lagging viewer can still be pointed at them. Holds at most `capacity`
/// entries and forgets the oldest first.
#[derive(Debug)]
pub struct ArchiveIndex {
    capacity: usize,
    entries: RwLock<Entries>,
}

#[derive(Debug, Default)]
struct Entries {
    by_key: HashMap<String, Locator>,
    order: VecDeque<String>,
}

impl Default for ArchiveIndex {
    fn default() -> Self {
        Self::with_capacity(4096)
    }
}

impl ArchiveIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(Entries::default()),
        }
    }

    /// Returns the entry pushed out to make room, if any.
    pub fn insert(&self, key: String, locator: Locator) -> Option<Locator> {
        let mut entries = self.entries.write();
        if entries.by_key.insert(key.clone(), locator).is_some() {
            return None;
        }
        entries.order.push_back(key);

        if entries.order.len() <= self.capacity {
            return None;
        }
        let oldest = entries.order.pop_front()?;
        entries.by_key.remove(&oldest)
    }

    pub fn get(&self, key: &str) -> Option<Locator> {
        self.entries.read().by_key.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().by_key.len()
    }

    /// Removes and returns every entry written by the given producer session.
    pub fn take_session(&self, identifier: &str) -> Vec<Locator> {
        let mut entries = self.entries.write();
        let belongs = |key: &str| {
            key.rsplit_once('/')
                .is_some_and(|(_, file)| HlsLayout::belongs_to(identifier, file))
        };

        entries.order.retain(|key| !belongs(key));
        let keys: Vec<String> = entries
            .by_key
            .keys()
            .filter(|key| belongs(key))
            .cloned()
            .collect();
        keys.iter()
            .filter_map(|key| entries.by_key.remove(key))
            .collect()
    }
}
