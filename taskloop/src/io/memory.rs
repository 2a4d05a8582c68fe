//! Optional session memory consulted before planning.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use anyhow::{Result, anyhow};

/// Text memory keyed by session. Failures are the caller's to log and ignore.
pub trait MemoryStore: Send + Sync {
    fn append(&self, session_id: &str, text: &str) -> Result<()>;

    /// At most `limit` entries relevant to `query`, most relevant first.
    fn retrieve(&self, session_id: &str, query: &str, limit: usize) -> Result<Vec<String>>;
}

/// Remembers nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMemory;

impl MemoryStore for NoopMemory {
    fn append(&self, _session_id: &str, _text: &str) -> Result<()> {
        Ok(())
    }

    fn retrieve(&self, _session_id: &str, _query: &str, _limit: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Process-local memory ranked by keyword overlap with the query.
///
/// Entries sharing no keyword with the query are never returned; ties go to
/// the newer entry.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    sessions: Mutex<HashMap<String, Vec<String>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self, session_id: &str) -> Vec<String> {
        self.sessions
            .lock()
            .ok()
            .and_then(|sessions| sessions.get(session_id).cloned())
            .unwrap_or_default()
    }
}

impl MemoryStore for InMemoryStore {
    fn append(&self, session_id: &str, text: &str) -> Result<()> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("memory lock poisoned"))?;
        sessions
            .entry(session_id.to_string())
            .or_default()
            .push(text.to_string());
        Ok(())
    }

    fn retrieve(&self, session_id: &str, query: &str, limit: usize) -> Result<Vec<String>> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("memory lock poisoned"))?;
        let Some(entries) = sessions.get(session_id) else {
            return Ok(Vec::new());
        };

        let wanted = keywords(query);
        let mut scored: Vec<(usize, usize, &String)> = entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                let overlap = keywords(entry).intersection(&wanted).count();
                (overlap > 0).then_some((overlap, index, entry))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, _, entry)| entry.clone())
            .collect())
    }
}

fn keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() > 2)
        .map(str::to_lowercase)
        .collect()
}
