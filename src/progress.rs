// ABOUTME: Turns mongodump/mongorestore log lines into document-level progress
// ABOUTME: Tracks per-collection counters and reports totals only when they change

use regex::Regex;
use std::collections::BTreeMap;
use tracing::debug;

use crate::models::CollectionCount;

const PROGRESS_PATTERN: &str =
    r"\[[^\]]*\]\s+(?P<ns>\S+)\s+(?P<done>\d+)/(?P<total>\d+)\s+\(\s*[\d.]+%\)";
const FINISHED_PATTERN: &str =
    r"(?:done dumping|finished restoring)\s+(?P<ns>\S+)\s+\((?P<count>\d+) documents?";

/// Which tool's output is being parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorMode {
    /// Incremental progress bars and completion lines.
    Dump,
    /// Completion lines only; restores do not report incremental counts.
    Restore,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub current: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CollectionCounter {
    completed: u64,
    total: u64,
}

/// Per-run parser for one dump or restore.
///
/// Output is consumed as raw bytes and split into lines; a partial line is
/// held until the rest of it arrives. Lines that match neither the progress
/// bar shape
///
/// ```text
/// 2024-05-01T10:00:00.000+0000    [####....................]  app.users  1200/5000  (24.0%)
/// ```
///
/// nor a completion shape (`done dumping app.users (5000 documents)`,
/// `finished restoring app.users (5000 documents, 0 failures)`) are skipped.
pub struct ProgressExtractor {
    mode: ExtractorMode,
    counters: BTreeMap<String, CollectionCounter>,
    pending: Vec<u8>,
    progress_line: Regex,
    finished_line: Regex,
}

impl ProgressExtractor {
    pub fn new<I>(mode: ExtractorMode, collections: I) -> Self
    where
        I: IntoIterator<Item = CollectionCount>,
    {
        let counters = collections
            .into_iter()
            .map(|c| {
                (
                    c.name,
                    CollectionCounter {
                        completed: 0,
                        total: c.documents,
                    },
                )
            })
            .collect();

        Self {
            mode,
            counters,
            pending: Vec::new(),
            progress_line: Regex::new(PROGRESS_PATTERN)
                .expect("progress line pattern is valid"),
            finished_line: Regex::new(FINISHED_PATTERN)
                .expect("finished line pattern is valid"),
        }
    }

    pub fn dump<I>(collections: I) -> Self
    where
        I: IntoIterator<Item = CollectionCount>,
    {
        Self::new(ExtractorMode::Dump, collections)
    }

    pub fn restore<I>(collections: I) -> Self
    where
        I: IntoIterator<Item = CollectionCount>,
    {
        Self::new(ExtractorMode::Restore, collections)
    }

    /// Consume a chunk of tool output. Returns a snapshot only if a counter changed.
    pub fn feed(&mut self, bytes: &[u8]) -> Option<ProgressSnapshot> {
        self.pending.extend_from_slice(bytes);

        let mut changed = false;
        while let Some(end) = line_end(&self.pending) {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            changed |= self.apply_line(&String::from_utf8_lossy(&line));
        }

        changed.then(|| self.snapshot())
    }

    /// Parse whatever partial line is still buffered.
    pub fn finish(&mut self) -> Option<ProgressSnapshot> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        self.apply_line(&String::from_utf8_lossy(&line))
            .then(|| self.snapshot())
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let mut snapshot = ProgressSnapshot::default();
        for counter in self.counters.values() {
            snapshot.current += counter.completed;
            snapshot.total += counter.total;
        }
        snapshot
    }

    /// Current per-collection totals, in collection name order.
    pub fn collection_counts(&self) -> Vec<CollectionCount> {
        self.counters
            .iter()
            .map(|(name, c)| CollectionCount {
                name: name.clone(),
                documents: c.total.max(c.completed),
            })
            .collect()
    }

    fn apply_line(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return false;
        }

        if let Some(caps) = self.finished_line.captures(line) {
            let collection = collection_name(&caps["ns"]).to_string();
            let Ok(count) = caps["count"].parse::<u64>() else {
                debug!(line, "skipping completion line with unreadable count");
                return false;
            };
            let seed = CollectionCounter {
                completed: 0,
                total: count,
            };
            let counter = self.counters.entry(collection).or_insert(seed);
            let before = *counter;
            counter.completed = counter.total;
            return *counter != before;
        }

        if self.mode == ExtractorMode::Dump {
            if let Some(caps) = self.progress_line.captures(line) {
                let collection = collection_name(&caps["ns"]).to_string();
                let done = caps["done"].parse::<u64>();
                let total = caps["total"].parse::<u64>();
                let (Ok(done), Ok(total)) = (done, total) else {
                    debug!(line, "skipping progress line with unreadable counts");
                    return false;
                };
                let counter = self.counters.entry(collection).or_default();
                let before = *counter;
                counter.completed = done;
                counter.total = total;
                return *counter != before;
            }
        }

        debug!(line, "ignoring tool output");
        false
    }
}

fn line_end(bytes: &[u8]) -> Option<usize> {
    bytes.iter().position(|b| matches!(*b, b'\n' | b'\r'))
}

/// `app.users` -> `users`; collection names may themselves contain dots.
fn collection_name(namespace: &str) -> &str {
    namespace
        .split_once('.')
        .map(|(_, collection)| collection)
        .unwrap_or(namespace)
}
