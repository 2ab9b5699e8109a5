//! Free-form operator notes attached to the deployment.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{AdminError, AdminResult};

pub const MAX_TITLE_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: u64,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create / update payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NoteDraft {
    pub title: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Default)]
struct Notes {
    next_id: u64,
    entries: BTreeMap<u64, Note>,
}

#[derive(Default)]
pub struct NoteStore {
    inner: RwLock<Notes>,
}

impl NoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(draft: &NoteDraft) -> AdminResult<()> {
        let title = draft.title.trim();
        if title.is_empty() || title.len() > MAX_TITLE_LEN {
            return Err(AdminError::InvalidRequest {
                reason: format!("note title must be 1..={} characters", MAX_TITLE_LEN),
            });
        }
        Ok(())
    }

    fn missing(id: u64) -> AdminError {
        AdminError::NotFound {
            what: format!("note {}", id),
        }
    }

    pub fn create(&self, draft: NoteDraft) -> AdminResult<Note> {
        Self::check(&draft)?;
        let now = Utc::now();
        let mut inner = self.inner.write();
        inner.next_id += 1;
        let note = Note {
            id: inner.next_id,
            title: draft.title.trim().to_string(),
            body: draft.body,
            created_at: now,
            updated_at: now,
        };
        inner.entries.insert(note.id, note.clone());
        Ok(note)
    }

    pub fn get(&self, id: u64) -> AdminResult<Note> {
        self.inner
            .read()
            .entries
            .get(&id)
            .cloned()
            .ok_or_else(|| Self::missing(id))
    }

    /// All notes, newest first.
    pub fn list(&self) -> Vec<Note> {
        self.inner.read().entries.values().rev().cloned().collect()
    }

    pub fn update(&self, id: u64, draft: NoteDraft) -> AdminResult<Note> {
        Self::check(&draft)?;
        let mut inner = self.inner.write();
        let note = inner.entries.get_mut(&id).ok_or_else(|| Self::missing(id))?;
        note.title = draft.title.trim().to_string();
        note.body = draft.body;
        note.updated_at = Utc::now();
        Ok(note.clone())
    }

    pub fn delete(&self, id: u64) -> AdminResult<()> {
        self.inner
            .write()
            .entries
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Self::missing(id))
    }
}
