//! Fetch tracking for populate calls.
//!
//! Every batch fetch the loader issues is recorded against the populate path
//! it served (`Author.books.reviews`). Within one `populate` call each path
//! must be fetched at most once; a second fetch for the same path means
//! batching broke down and is reported as a warning.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// How a batch was fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    /// Direct find by filter.
    Find,
    /// Many-to-many load through a join table.
    Pivot,
}

/// A single recorded fetch.
#[derive(Debug, Clone)]
pub struct FetchRecord {
    /// The populate call that issued the fetch
    pub call: u64,
    /// Populate path, rooted at the entity type
    pub path: String,
    /// Entity type fetched
    pub entity_type: String,
    pub kind: FetchKind,
    /// Number of keys in the batch
    pub keys: usize,
    /// When the fetch was issued
    pub timestamp: Instant,
}

/// Statistics about recorded fetches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchStats {
    /// Total number of fetches recorded
    pub total_fetches: usize,
    /// Fetches that went through a join table
    pub pivot_loads: usize,
    /// Number of distinct paths fetched
    pub nodes_loaded: usize,
    /// Fetches for a path already fetched in the same call
    pub repeated_nodes: usize,
}

/// Records fetches per populate call.
#[derive(Debug)]
pub struct FetchTracker {
    enabled: bool,
    next_call: u64,
    /// call -> path -> fetches in that call
    active: HashMap<u64, HashMap<String, usize>>,
    paths: HashSet<String>,
    records: Vec<FetchRecord>,
    stats: FetchStats,
}

impl Default for FetchTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: true,
            next_call: 0,
            active: HashMap::new(),
            paths: HashSet::new(),
            records: Vec::new(),
            stats: FetchStats::default(),
        }
    }

    /// Set whether fetches are recorded (builder pattern).
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Open a populate call and return its id.
    pub fn begin_call(&mut self) -> u64 {
        self.next_call += 1;
        let call = self.next_call;
        if self.enabled {
            self.active.insert(call, HashMap::new());
        }
        call
    }

    /// Record one fetch issued by `call` for `path`.
    pub fn record(&mut self, call: u64, path: &str, entity_type: &str, kind: FetchKind, keys: usize) {
        if !self.enabled {
            return;
        }

        let count = {
            let per_call = self.active.entry(call).or_default();
            let count = per_call.entry(path.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        self.stats.total_fetches += 1;
        if kind == FetchKind::Pivot {
            self.stats.pivot_loads += 1;
        }
        if self.paths.insert(path.to_string()) {
            self.stats.nodes_loaded = self.paths.len();
        }
        self.records.push(FetchRecord {
            call,
            path: path.to_string(),
            entity_type: entity_type.to_string(),
            kind,
            keys,
            timestamp: Instant::now(),
        });

        if count > 1 {
            self.stats.repeated_nodes += 1;
            tracing::warn!(
                target: "relfill::batch",
                path = path,
                entity = entity_type,
                fetches = count,
                "Relation fetched more than once in a single populate call"
            );
        }
    }

    /// Close a populate call and log its summary.
    pub fn end_call(&mut self, call: u64) {
        let Some(per_call) = self.active.remove(&call) else {
            return;
        };
        let fetches: usize = per_call.values().sum();
        let repeated = per_call.values().filter(|c| **c > 1).count();
        if repeated > 0 {
            tracing::warn!(
                target: "relfill::batch",
                call = call,
                fetches = fetches,
                repeated_paths = repeated,
                "Populate call issued repeated fetches"
            );
        } else {
            tracing::debug!(
                target: "relfill::batch",
                call = call,
                fetches = fetches,
                paths = per_call.len(),
                "Populate call completed"
            );
        }
    }

    /// Fetches recorded for a path across all calls.
    #[must_use]
    pub fn count_for(&self, path: &str) -> usize {
        self.records.iter().filter(|r| r.path == path).count()
    }

    #[must_use]
    pub fn stats(&self) -> FetchStats {
        self.stats.clone()
    }

    #[must_use]
    pub fn records(&self) -> &[FetchRecord] {
        &self.records
    }

    /// Forget all recorded fetches.
    pub fn reset(&mut self) {
        self.paths.clear();
        self.records.clear();
        self.stats = FetchStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_defaults() {
        let tracker = FetchTracker::new();
        assert!(tracker.is_enabled());
        assert_eq!(tracker.stats(), FetchStats::default());
    }

    #[test]
    fn test_records_per_path() {
        let mut tracker = FetchTracker::new();
        let call = tracker.begin_call();
        tracker.record(call, "Author.books", "Book", FetchKind::Find, 2);
        tracker.record(call, "Author.books.tags", "Tag", FetchKind::Pivot, 4);
        tracker.end_call(call);

        let stats = tracker.stats();
        assert_eq!(stats.total_fetches, 2);
        assert_eq!(stats.pivot_loads, 1);
        assert_eq!(stats.nodes_loaded, 2);
        assert_eq!(stats.repeated_nodes, 0);
        assert_eq!(tracker.count_for("Author.books"), 1);
        assert_eq!(tracker.records()[1].keys, 4);
    }

    #[test]
    fn test_repeated_path_in_one_call() {
        let mut tracker = FetchTracker::new();
        let call = tracker.begin_call();
        tracker.record(call, "Author.books", "Book", FetchKind::Find, 1);
        tracker.record(call, "Author.books", "Book", FetchKind::Find, 1);
        tracker.end_call(call);
        assert_eq!(tracker.stats().repeated_nodes, 1);
    }

    #[test]
    fn test_same_path_in_separate_calls_is_not_repeated() {
        let mut tracker = FetchTracker::new();
        for _ in 0..2 {
            let call = tracker.begin_call();
            tracker.record(call, "Author.books", "Book", FetchKind::Find, 1);
            tracker.end_call(call);
        }
        let stats = tracker.stats();
        assert_eq!(stats.total_fetches, 2);
        assert_eq!(stats.nodes_loaded, 1);
        assert_eq!(stats.repeated_nodes, 0);
    }

    #[test]
    fn test_disabled_records_nothing() {
        let mut tracker = FetchTracker::new().with_enabled(false);
        let call = tracker.begin_call();
        tracker.record(call, "Author.books", "Book", FetchKind::Find, 1);
        tracker.end_call(call);
        assert_eq!(tracker.stats().total_fetches, 0);

        tracker.enable();
        let call = tracker.begin_call();
        tracker.record(call, "Author.books", "Book", FetchKind::Find, 1);
        assert_eq!(tracker.stats().total_fetches, 1);
    }

    #[test]
    fn test_reset() {
        let mut tracker = FetchTracker::new();
        let call = tracker.begin_call();
        tracker.record(call, "Author.books", "Book", FetchKind::Find, 1);
        tracker.reset();
        assert_eq!(tracker.stats().total_fetches, 0);
        assert!(tracker.records().is_empty());
    }
}
