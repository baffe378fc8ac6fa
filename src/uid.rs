//! Process-wide unique id generation for `clientRequestUid` and subrequest ids.

use uuid::Uuid;

/// Thread-safe generator of universally-unique identifiers.
///
/// A single instance is shared across a process; `uuid::Uuid::new_v4` is
/// already safe to call concurrently, so this wrapper exists mainly to give
/// callers a single injectable seam (tests can swap in a deterministic
/// generator without touching call sites).
#[derive(Debug, Default, Clone, Copy)]
pub struct UidGenerator;

impl UidGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn next(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Derives a fresh uid for a composite artifact produced from `parent`,
    /// e.g. a binned frame split off from an oversize `IngestionFrame`.
    pub fn derive(&self, _parent: &str) -> String {
        Uuid::new_v4().to_string()
    }
}
