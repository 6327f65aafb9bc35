//! Event persistence: the store trait the relay queries, plus a file-backed
//! implementation.

use std::{
    collections::HashSet,
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{bail, Result};
use rand::{seq::SliceRandom, thread_rng};
use serde_json::to_writer;
use sha2::{Digest, Sha256};

use crate::{event::Event, filter::Filter, verify::SignatureVerifier};

/// Storage collaborator used for persistence, REQ replay and COUNT.
///
/// Implementations are called from blocking threads and must be thread-safe.
pub trait EventStore: Send + Sync {
    /// Persist an event. Returns `false` if it was already stored.
    fn store(&self, ev: &Event) -> Result<bool>;
    /// Stored events matching any filter, newest first, each filter capped by
    /// its `limit`.
    fn query(&self, filters: &[Filter]) -> Result<Vec<Event>>;
    /// Number of stored events matching any filter; `limit` is ignored.
    fn count(&self, filters: &[Filter]) -> Result<u64>;
}

/// Persistent store for events and indexes rooted at `root`.
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
    /// Serializes the exists-check and write of [`Store::ingest`].
    ingest_lock: Arc<Mutex<()>>,
}

impl Store {
    /// Create a new store rooted at `root`.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            ingest_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Ensure the on-disk directory structure exists.
    pub fn init(&self) -> Result<()> {
        let dirs = [
            "events",
            "log",
            "index/by-author",
            "index/by-kind",
            "index/by-tag",
        ];
        for d in dirs {
            fs::create_dir_all(self.root.join(d))?;
        }
        Ok(())
    }

    /// Ingest an event if it doesn't already exist on disk.
    ///
    /// Indexes are written before the event file, so an event is only
    /// reported as already stored once it is fully indexed. A failed ingest
    /// leaves at most index entries pointing at a missing file, which
    /// queries skip.
    pub fn ingest(&self, ev: &Event) -> Result<bool> {
        if ev.id.len() < 4 || !ev.id.bytes().all(|b| b.is_ascii_hexdigit()) {
            bail!("event id must be hex");
        }
        let _guard = self.ingest_lock.lock().unwrap_or_else(|e| e.into_inner());
        // Skip ingest if the event already exists on disk.
        let path = self.event_path(&ev.id);
        if path.exists() {
            return Ok(false);
        }
        self.index_event(ev)?;

        // Write the event JSON atomically to its canonical path.
        let parent_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent_dir)?;
        let tmp = tempfile::NamedTempFile::new_in(&parent_dir)?;
        to_writer(&tmp, ev)?;
        // Another process may have stored it since the check above.
        if let Err(e) = tmp.persist_noclobber(&path) {
            if e.error.kind() == ErrorKind::AlreadyExists {
                return Ok(false);
            }
            return Err(e.error.into());
        }

        // Append the event to a newline-delimited log for easy tailing.
        let log_dir = self.root.join("log");
        fs::create_dir_all(&log_dir)?;
        let mut log_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("events.ndjson"))?;
        serde_json::to_writer(&mut log_file, ev)?;
        log_file.write_all(b"\n")?;
        Ok(true)
    }

    /// Verify signatures for a random sample of stored events.
    pub fn verify_sample(&self, sample: usize, verifier: &dyn SignatureVerifier) -> Result<usize> {
        let mut paths = self.event_files()?;
        let mut rng = thread_rng();
        paths.shuffle(&mut rng);
        let take = sample.min(paths.len());
        for p in paths.iter().take(take) {
            let data = fs::read_to_string(p)?;
            let ev: Event = serde_json::from_str(&data)?;
            verifier.verify(&ev)?;
        }
        Ok(take)
    }

    /// Rebuild all indexes from the `events/` tree.
    pub fn reindex(&self) -> Result<()> {
        let index_dir = self.root.join("index");
        if index_dir.exists() {
            fs::remove_dir_all(&index_dir)?;
        }
        fs::create_dir_all(self.root.join("index/by-author"))?;
        fs::create_dir_all(self.root.join("index/by-kind"))?;
        fs::create_dir_all(self.root.join("index/by-tag"))?;

        for path in self.event_files()? {
            let data = fs::read_to_string(path)?;
            let ev: Event = serde_json::from_str(&data)?;
            self.index_event(&ev)?;
        }
        Ok(())
    }

    /// Record an event under its author, kind and single-letter tags.
    fn index_event(&self, ev: &Event) -> Result<()> {
        self.append_index("index/by-author", &ev.pubkey, &ev.id)?;
        self.append_index("index/by-kind", &ev.kind.to_string(), &ev.id)?;
        let mut seen = HashSet::new();
        for tag in &ev.tags {
            if let (Some(key), Some(value)) = (tag.key(), tag.value()) {
                if is_indexed_tag(key) && seen.insert((key, value)) {
                    self.append_index(&format!("index/by-tag/{key}"), value, &ev.id)?;
                }
            }
        }
        Ok(())
    }

    /// Append an event ID to the index file for `name` under `prefix`.
    fn append_index(&self, prefix: &str, name: &str, id: &str) -> Result<()> {
        let path = self.index_path(prefix, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(f, "{}", id)?;
        Ok(())
    }

    fn index_path(&self, prefix: &str, name: &str) -> PathBuf {
        self.root
            .join(prefix)
            .join(format!("{}.txt", index_file_stem(name)))
    }

    /// Compute the canonical path for an event ID.
    fn event_path(&self, id: &str) -> PathBuf {
        let sub1 = id.get(0..2).unwrap_or("__");
        let sub2 = id.get(2..4).unwrap_or("__");
        self.root
            .join("events")
            .join(sub1)
            .join(sub2)
            .join(format!("{}.json", id))
    }

    fn event_files(&self) -> Result<Vec<PathBuf>> {
        let mut paths = vec![];
        let events = self.root.join("events");
        if !events.exists() {
            return Ok(paths);
        }
        for entry in walkdir::WalkDir::new(events) {
            let entry = entry?;
            if entry.file_type().is_file() {
                paths.push(entry.into_path());
            }
        }
        Ok(paths)
    }

    /// Helper to load ID sets for a list of keys under `prefix`.
    fn load_ids<'a>(
        &self,
        prefix: &str,
        keys: impl IntoIterator<Item = &'a String>,
    ) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        for key in keys {
            ids.extend(read_ids(&self.index_path(prefix, key))?);
        }
        Ok(ids)
    }

    /// Candidate IDs for one filter, or `None` when no indexed field is set
    /// and every stored event has to be considered.
    fn candidates(&self, f: &Filter) -> Result<Option<HashSet<String>>> {
        // Collect ID sets for each indexed constraint and intersect them below.
        let mut sets: Vec<HashSet<String>> = vec![];
        if let Some(ids) = &f.ids {
            sets.push(ids.iter().filter(|id| is_hex(id)).cloned().collect());
        }
        if let Some(authors) = &f.authors {
            sets.push(self.load_ids("index/by-author", authors)?);
        }
        if let Some(kinds) = &f.kinds {
            let keys: Vec<String> = kinds.iter().map(|k| k.to_string()).collect();
            sets.push(self.load_ids("index/by-kind", &keys)?);
        }
        for (key, values) in &f.tags {
            if is_indexed_tag(key) {
                sets.push(self.load_ids(&format!("index/by-tag/{key}"), values)?);
            }
        }
        let mut iter = sets.into_iter();
        let Some(mut ids) = iter.next() else {
            return Ok(None);
        };
        for s in iter {
            ids = ids.intersection(&s).cloned().collect();
        }
        Ok(Some(ids))
    }

    fn load_event(&self, id: &str) -> Option<Event> {
        let data = fs::read_to_string(self.event_path(id)).ok()?;
        serde_json::from_str(&data).ok()
    }

    /// Events matching one filter, newest first.
    fn query_one(&self, f: &Filter, apply_limit: bool) -> Result<Vec<Event>> {
        let mut events: Vec<Event> = match self.candidates(f)? {
            Some(ids) => ids.iter().filter_map(|id| self.load_event(id)).collect(),
            None => self
                .event_files()?
                .into_iter()
                .filter_map(|p| serde_json::from_str(&fs::read_to_string(p).ok()?).ok())
                .collect(),
        };
        events.retain(|ev| f.matches(ev));
        // Sort newest-first so addressable events keep the most recent version.
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        // Drop older addressable events sharing the same author, kind, and `#d` tag.
        let mut seen = HashSet::new();
        events.retain(|ev| {
            if !ev.is_addressable() {
                return true;
            }
            let d = ev.tag_value("d").unwrap_or_default();
            seen.insert(format!("{}:{}:{}", ev.pubkey, ev.kind, d))
        });
        if let (true, Some(limit)) = (apply_limit, f.limit) {
            events.truncate(limit);
        }
        Ok(events)
    }

    fn query_all(&self, filters: &[Filter], apply_limit: bool) -> Result<Vec<Event>> {
        let mut seen = HashSet::new();
        let mut out = vec![];
        for f in filters {
            for ev in self.query_one(f, apply_limit)? {
                if seen.insert(ev.id.clone()) {
                    out.push(ev);
                }
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }
}

impl EventStore for Store {
    fn store(&self, ev: &Event) -> Result<bool> {
        self.ingest(ev)
    }

    fn query(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        self.query_all(filters, true)
    }

    fn count(&self, filters: &[Filter]) -> Result<u64> {
        Ok(self.query_all(filters, false)?.len() as u64)
    }
}

/// Single-letter tags are indexed, as NIP-01 only defines queries on those.
fn is_indexed_tag(key: &str) -> bool {
    key.len() == 1 && key.bytes().all(|b| b.is_ascii_alphabetic())
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Keys up to this many bytes keep a readable stem.
const MAX_PLAIN_KEY: usize = 64;

/// File stem for an index key. Short alphanumeric keys are used as-is, other
/// short keys are hex encoded behind `~`, and longer keys are replaced by
/// their SHA-256 behind `=`. Stems never escape the index directory and stay
/// well under filesystem name limits; hash collisions are harmless because
/// candidates are re-checked against the filter.
fn index_file_stem(name: &str) -> String {
    if name.is_empty() || name.len() > MAX_PLAIN_KEY {
        format!("={}", hex::encode(Sha256::digest(name.as_bytes())))
    } else if name.bytes().all(|b| b.is_ascii_alphanumeric()) {
        name.to_string()
    } else {
        format!("~{}", hex::encode(name))
    }
}

/// Read newline-separated IDs from a text file.
fn read_ids(path: &Path) -> Result<HashSet<String>> {
    if !path.exists() {
        return Ok(Default::default());
    }
    let data = fs::read_to_string(path)?;
    Ok(data.lines().map(|s| s.to_string()).collect())
}
