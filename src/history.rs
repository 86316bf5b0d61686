//! Public and private message history, persisted as line-delimited
//! `sender|text` records.
//!
//! Grounded on `examples/original_source/Servidor/HistoryManager.cpp`:
//! the public log is read in full, trimmed, appended to, and rewritten in
//! full on every call — this crate keeps that rewrite-on-append semantic
//! rather than introducing a write-ahead log or atomic rename, since
//! spec.md §4.2 explicitly waives durability beyond process crash. File
//! I/O itself follows the teacher's `config.rs` idiom of plain
//! `std::fs` calls wrapped in `anyhow::Context`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

const PUBLIC_HISTORY_CAPACITY: usize = 50;

/// One history record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub sender: String,
    pub text: String,
}

fn parse_line(line: &str) -> Option<HistoryEntry> {
    let (sender, text) = line.split_once('|')?;
    Some(HistoryEntry {
        sender: sender.to_string(),
        text: text.to_string(),
    })
}

fn format_line(entry: &HistoryEntry) -> String {
    format!("{}|{}", entry.sender, entry.text)
}

fn read_entries(path: &Path) -> Result<Vec<HistoryEntry>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents.lines().filter_map(parse_line).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("reading history file {}", path.display())),
    }
}

/// Bounded FIFO public history, capped at 50 entries, backed by a single
/// file guarded by its own mutex (distinct from the directory mutex, per
/// spec.md §5 — never held across a directory operation).
pub struct PublicHistory {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PublicHistory {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Load current file into memory, drop the oldest entry if already at
    /// capacity, append the new one, rewrite the file in full.
    ///
    /// # Errors
    ///
    /// Logged by the caller rather than propagated up the session path
    /// (spec.md §7: history I/O failures are logged; in-memory delivery
    /// still proceeds), but returned here so callers can choose.
    pub fn append(&self, sender: &str, text: &str) -> Result<()> {
        let _guard = self.lock.lock().expect("public history mutex poisoned");
        let mut entries = read_entries(&self.path)?;
        if entries.len() >= PUBLIC_HISTORY_CAPACITY {
            entries.remove(0);
        }
        entries.push(HistoryEntry {
            sender: sender.to_string(),
            text: text.to_string(),
        });
        let contents: String = entries
            .iter()
            .map(format_line)
            .map(|line| line + "\n")
            .collect();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating history directory {}", parent.display()))?;
        }
        std::fs::write(&self.path, contents)
            .with_context(|| format!("writing history file {}", self.path.display()))
    }

    /// Ordered list of entries, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors other than a missing file (treated as empty
    /// history).
    pub fn load(&self) -> Result<Vec<HistoryEntry>> {
        let _guard = self.lock.lock().expect("public history mutex poisoned");
        read_entries(&self.path)
    }
}

/// Derives the canonical pair key `(min(a,b), max(a,b))` used for private
/// history filenames.
#[must_use]
pub fn canonical_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Unbounded per-pair private history, one file per canonical pair.
pub struct PrivateHistory {
    dir: PathBuf,
}

impl PrivateHistory {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, a: &str, b: &str) -> PathBuf {
        let (lo, hi) = canonical_pair(a, b);
        self.dir.join(format!("{lo}_{hi}.txt"))
    }

    /// Append `from|msg\n` to the canonical pair's file in append mode.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from creating the private-history directory
    /// or opening/writing the file.
    pub fn append(&self, from: &str, to: &str, msg: &str) -> Result<()> {
        use std::io::Write;
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating private history directory {}", self.dir.display()))?;
        let path = self.path_for(from, to);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening private history file {}", path.display()))?;
        writeln!(file, "{from}|{msg}").with_context(|| format!("appending to {}", path.display()))
    }

    /// Ordered list of entries for the canonical pair `(a, b)`. A
    /// nonexistent file is an empty history, not an error.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors other than a missing file.
    pub fn load(&self, a: &str, b: &str) -> Result<Vec<HistoryEntry>> {
        let path = self.path_for(a, b);
        read_entries(&path)
    }

    /// Whether a private log already exists for the canonical pair.
    #[must_use]
    pub fn exists(&self, a: &str, b: &str) -> bool {
        self.path_for(a, b).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn public_history_appends_and_loads_in_order() {
        let dir = TempDir::new().unwrap();
        let history = PublicHistory::new(dir.path().join("general.txt"));
        history.append("alice", "hi").unwrap();
        history.append("bob", "hello").unwrap();
        let entries = history.load().unwrap();
        assert_eq!(
            entries,
            vec![
                HistoryEntry { sender: "alice".into(), text: "hi".into() },
                HistoryEntry { sender: "bob".into(), text: "hello".into() },
            ]
        );
    }

    #[test]
    fn public_history_caps_at_fifty_and_keeps_most_recent() {
        let dir = TempDir::new().unwrap();
        let history = PublicHistory::new(dir.path().join("general.txt"));
        for i in 0..60 {
            history.append("alice", &format!("msg{i}")).unwrap();
        }
        let entries = history.load().unwrap();
        assert_eq!(entries.len(), 50);
        assert_eq!(entries.first().unwrap().text, "msg10");
        assert_eq!(entries.last().unwrap().text, "msg59");
    }

    #[test]
    fn public_history_load_on_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let history = PublicHistory::new(dir.path().join("nope.txt"));
        assert!(history.load().unwrap().is_empty());
    }

    #[test]
    fn private_history_pair_symmetry() {
        let dir = TempDir::new().unwrap();
        let history = PrivateHistory::new(dir.path().to_path_buf());
        history.append("alice", "bob", "hi").unwrap();
        history.append("bob", "alice", "hey").unwrap();
        assert_eq!(history.load("alice", "bob").unwrap(), history.load("bob", "alice").unwrap());
        assert_eq!(history.load("alice", "bob").unwrap().len(), 2);
    }

    #[test]
    fn private_history_unbounded() {
        let dir = TempDir::new().unwrap();
        let history = PrivateHistory::new(dir.path().to_path_buf());
        for i in 0..200 {
            history.append("alice", "bob", &format!("m{i}")).unwrap();
        }
        assert_eq!(history.load("alice", "bob").unwrap().len(), 200);
    }

    #[test]
    fn private_history_exists_reflects_file_presence() {
        let dir = TempDir::new().unwrap();
        let history = PrivateHistory::new(dir.path().to_path_buf());
        assert!(!history.exists("alice", "bob"));
        history.append("alice", "bob", "hi").unwrap();
        assert!(history.exists("alice", "bob"));
        assert!(history.exists("bob", "alice"));
    }
}
