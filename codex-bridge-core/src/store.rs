//! Durable, thread-safe index of `SessionRecord`s. One JSON line per
//! session on disk; an in-memory mirror (hash map plus an insertion-order
//! list) reconstructed from the log on load. Every mutation other than the
//! first-write append rewrites the log in full, because the log format is
//! append-only and has no in-place edit.

use crate::session::SessionRecord;
use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

const SESSIONS_FILE_NAME: &str = "sessions.jsonl";
const MIN_LIMIT: usize = 1;
const MAX_LIMIT: usize = 200;

struct StoreState {
    by_id: HashMap<String, SessionRecord>,
    /// Insertion order, oldest first. `list`/`search` walk this in reverse.
    order: Vec<String>,
    log_file: File,
}

pub struct SessionStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ListPage {
    pub data: Vec<SessionRecord>,
    pub next_cursor: Option<usize>,
}

impl SessionStore {
    pub fn open(state_dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(SESSIONS_FILE_NAME);

        let mut by_id = HashMap::new();
        let mut order = Vec::new();
        if let Ok(contents) = fs::read_to_string(&path) {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match SessionRecord::from_disk_line(line) {
                    Some(record) => {
                        if !by_id.contains_key(&record.conversation_id) {
                            order.push(record.conversation_id.clone());
                            by_id.insert(record.conversation_id.clone(), record);
                        }
                    }
                    None => {
                        tracing::warn!("skipping malformed session log line");
                    }
                }
            }
        }

        let log_file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            state: Mutex::new(StoreState {
                by_id,
                order,
                log_file,
            }),
        })
    }

    /// Adds `record` if its id is new. A duplicate id is a silent no-op —
    /// the first write wins. Append failures are logged and swallowed; the
    /// in-memory state is updated regardless so repeated adds within one
    /// run never drift from what callers believe they stored.
    pub fn add(&self, record: SessionRecord) {
        let mut state = lock(&self.state);
        if state.by_id.contains_key(&record.conversation_id) {
            return;
        }
        let line = record.to_disk_line();
        if let Err(err) = writeln!(state.log_file, "{line}") {
            tracing::error!("failed to persist session record: {err}");
        }
        state.order.push(record.conversation_id.clone());
        state.by_id.insert(record.conversation_id.clone(), record);
    }

    pub fn get(&self, conversation_id: &str) -> Option<SessionRecord> {
        lock(&self.state).by_id.get(conversation_id).cloned()
    }

    pub fn list(&self, limit: Option<i64>, cursor: Option<&str>) -> ListPage {
        let limit = clamp_limit(limit);
        let offset = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);

        let state = lock(&self.state);
        let total = state.order.len();
        let reversed: Vec<&String> = state.order.iter().rev().collect();

        if offset >= total {
            return ListPage {
                data: Vec::new(),
                next_cursor: None,
            };
        }

        let end = (offset + limit).min(total);
        let data = reversed[offset..end]
            .iter()
            .filter_map(|id| state.by_id.get(id.as_str()).cloned())
            .collect();
        let next_cursor = if end < total { Some(end) } else { None };

        ListPage { data, next_cursor }
    }

    pub fn search(&self, query: &str, limit: Option<i64>) -> Vec<SessionRecord> {
        let limit = clamp_limit(limit);
        let needle = query.to_lowercase();
        let state = lock(&self.state);
        state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.by_id.get(id.as_str()))
            .filter(|record| {
                record
                    .name
                    .as_deref()
                    .map(|n| n.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn update_name(&self, conversation_id: &str, name: String) -> Option<SessionRecord> {
        let mut state = lock(&self.state);
        let record = state.by_id.get_mut(conversation_id)?;
        record.name = Some(name);
        let updated = record.clone();
        rewrite_locked(&self.path, &mut state);
        Some(updated)
    }

    pub fn increment_history(&self, conversation_id: &str) -> Option<SessionRecord> {
        let mut state = lock(&self.state);
        let record = state.by_id.get_mut(conversation_id)?;
        record.history_entry_count = Some(record.history_entry_count.unwrap_or(0) + 1);
        let updated = record.clone();
        rewrite_locked(&self.path, &mut state);
        Some(updated)
    }

    pub fn delete(&self, conversation_id: &str) -> bool {
        let mut state = lock(&self.state);
        if state.by_id.remove(conversation_id).is_none() {
            return false;
        }
        state.order.retain(|id| id != conversation_id);
        rewrite_locked(&self.path, &mut state);
        true
    }

    pub fn count(&self) -> usize {
        lock(&self.state).by_id.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn clamp_limit(limit: Option<i64>) -> usize {
    match limit {
        None => MAX_LIMIT,
        Some(n) if n <= 0 => MIN_LIMIT,
        Some(n) if n as usize > MAX_LIMIT => MAX_LIMIT,
        Some(n) => n as usize,
    }
}

fn rewrite_locked(path: &Path, state: &mut StoreState) {
    let mut buffer = String::new();
    for id in &state.order {
        if let Some(record) = state.by_id.get(id) {
            buffer.push_str(&record.to_disk_line());
            buffer.push('\n');
        }
    }

    let tmp_path = path.with_extension("jsonl.tmp");
    let result = fs::write(&tmp_path, &buffer).and_then(|_| fs::rename(&tmp_path, path));
    match result {
        Ok(()) => match OpenOptions::new().append(true).open(path) {
            Ok(file) => state.log_file = file,
            Err(err) => tracing::error!("failed to reopen session log after rewrite: {err}"),
        },
        Err(err) => tracing::error!("failed to rewrite session log: {err}"),
    }
}

fn lock(state: &Mutex<StoreState>) -> std::sync::MutexGuard<'_, StoreState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
