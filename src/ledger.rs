//! Durable record of contacts already migrated.
//!
//! The ledger is a plain-text file with one guid per line. It is read in
//! full at the start of a run and appended to once at the end; guids are
//! only ever added for contacts that reached `Added` or `AlreadyExists`.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::Path;

/// Set of processed guids, split into what was loaded and what this run
/// has marked for writing.
#[derive(Debug, Clone, Default)]
pub struct ProcessedLedger {
    known: HashSet<String>,
    pending: Vec<String>,
}

impl ProcessedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ledger from guids that were persisted by earlier runs.
    pub fn from_guids<I, S>(guids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: guids.into_iter().map(Into::into).collect(),
            pending: Vec::new(),
        }
    }

    /// Read the ledger file. A missing file is an empty ledger.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no ledger file, starting empty");
                return Ok(Self::new());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read ledger: {}", path.display()))
            }
        };

        let ledger = Self::from_guids(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty()),
        );
        tracing::info!(path = %path.display(), entries = ledger.known.len(), "loaded ledger");
        Ok(ledger)
    }

    /// Whether the guid was migrated before or during this run.
    pub fn contains(&self, guid: &str) -> bool {
        self.known.contains(guid) || self.pending.iter().any(|g| g == guid)
    }

    /// Whether the guid was loaded from an earlier run. Guids recorded in
    /// this run do not count, so a contact in several groups is added to
    /// each of them.
    pub fn was_processed_before(&self, guid: &str) -> bool {
        self.known.contains(guid)
    }

    /// Mark a guid as reconciled in this run. Returns `false` if it was
    /// already present.
    pub fn record(&mut self, guid: &str) -> bool {
        if self.contains(guid) {
            return false;
        }
        self.pending.push(guid.to_string());
        true
    }

    /// Guids recorded during this run, in recording order.
    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    /// Total number of guids, loaded plus pending.
    pub fn len(&self) -> usize {
        self.known.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append the pending guids to the ledger file and fold them into the
    /// known set. Returns how many lines were written.
    pub fn flush(&mut self, path: &Path) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open ledger for append: {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        for guid in &self.pending {
            writeln!(writer, "{}", guid)?;
        }
        writer.flush()?;

        let written = self.pending.len();
        self.known.extend(self.pending.drain(..));
        tracing::info!(path = %path.display(), written, "ledger flushed");
        Ok(written)
    }
}
