//! Ledger of file mutations made by tools during a session.
//!
//! At most one change is tracked per path. Later changes merge into it: the merged record keeps
//! the first original content ever seen and the latest new content, so its diff always spans
//! the whole session.

use std::sync::{Arc, Mutex};

use kestrel_diff::{DiffStats, calculate_diff_stats, generate_unified_diff};
use serde::Serialize;

use crate::context::unix_millis;
use crate::executor::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Create,
    Edit,
    Delete,
    Rename,
}

impl ChangeType {
    /// Classify a change by which sides exist.
    #[must_use]
    pub fn infer(original: Option<&str>, new: Option<&str>) -> Self {
        match (original, new) {
            (Some(_), Some(_)) => Self::Edit,
            (None, Some(_)) => Self::Create,
            (Some(_) | None, None) => Self::Delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileChange {
    pub file_path: String,
    pub change_type: ChangeType,
    pub original_content: Option<String>,
    pub new_content: Option<String>,
    pub timestamp_ms: u64,
    pub metadata: Metadata,
}

impl FileChange {
    #[must_use]
    pub fn new(
        file_path: impl Into<String>,
        change_type: ChangeType,
        original_content: Option<String>,
        new_content: Option<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            change_type,
            original_content,
            new_content,
            timestamp_ms: unix_millis(),
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn diff_stats(&self) -> DiffStats {
        calculate_diff_stats(self.original_content.as_deref(), self.new_content.as_deref())
    }

    #[must_use]
    pub fn unified_diff(&self) -> String {
        generate_unified_diff(
            self.original_content.as_deref(),
            self.new_content.as_deref(),
            &self.file_path,
            3,
        )
    }

    fn merge(self, incoming: Self) -> Self {
        let mut metadata = self.metadata;
        metadata.extend(incoming.metadata);
        metadata.insert("merged".into(), "true".into());
        Self {
            change_type: ChangeType::infer(
                self.original_content.as_deref(),
                incoming.new_content.as_deref(),
            ),
            file_path: self.file_path,
            original_content: self.original_content,
            new_content: incoming.new_content,
            timestamp_ms: incoming.timestamp_ms,
            metadata,
        }
    }
}

/// Observer of recorded changes. Called synchronously on the recording task.
pub trait FileChangeListener: Send + Sync {
    fn on_file_changed(&self, change: &FileChange);
}

impl<F> FileChangeListener for F
where
    F: Fn(&FileChange) + Send + Sync,
{
    fn on_file_changed(&self, change: &FileChange) {
        self(change);
    }
}

#[derive(Default)]
pub struct FileChangeTracker {
    changes: Mutex<Vec<FileChange>>,
    listeners: Mutex<Vec<Arc<dyn FileChangeListener>>>,
}

impl std::fmt::Debug for FileChangeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChangeTracker")
            .field("changes", &self.change_count())
            .finish_non_exhaustive()
    }
}

impl FileChangeTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn FileChangeListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(listener);
    }

    /// Returns `true` if the listener was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn FileChangeListener>) -> bool {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Insert `change`, or merge it into the change already tracked for its path, then notify
    /// listeners with the stored record.
    pub fn record_change(&self, change: FileChange) {
        let stored = {
            let mut changes = self
                .changes
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(pos) = changes.iter().position(|c| c.file_path == change.file_path) {
                let existing = changes.remove(pos);
                let merged = existing.merge(change);
                changes.insert(pos, merged.clone());
                merged
            } else {
                changes.push(change.clone());
                change
            }
        };

        tracing::debug!(
            path = %stored.file_path,
            change = ?stored.change_type,
            "file change recorded"
        );

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_file_changed(&stored);
        }
    }

    #[must_use]
    pub fn get_changes(&self) -> Vec<FileChange> {
        self.changes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn get_changes_for_file(&self, file_path: &str) -> Vec<FileChange> {
        self.changes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|c| c.file_path == file_path)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn change_count(&self) -> usize {
        self.changes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Drop the tracked change for `change.file_path`. Returns `true` if one existed.
    pub fn remove_change(&self, change: &FileChange) -> bool {
        let mut changes = self
            .changes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = changes.len();
        changes.retain(|c| c.file_path != change.file_path);
        changes.len() != before
    }

    /// Distinct paths in first-recorded order.
    #[must_use]
    pub fn changed_file_paths(&self) -> Vec<String> {
        let changes = self
            .changes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut paths: Vec<String> = Vec::with_capacity(changes.len());
        for change in changes.iter() {
            if !paths.contains(&change.file_path) {
                paths.push(change.file_path.clone());
            }
        }
        paths
    }

    pub fn clear_changes(&self) {
        self.changes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}
