//! Merges sender-side (local) and receiver-side (remote) progress into one
//! monotonic, UI-safe percentage per file and overall.
//!
//! Rules:
//! - effective = max(local, remote), never decreasing
//! - capped at 99 until the receiver confirms completion
//! - per file, a remote 100 wins immediately
//! - a value is emitted only when it differs from the last emitted one

use std::collections::{HashMap, HashSet};

use crate::core::config::UNCONFIRMED_PERCENT_CAP;

#[derive(Debug, Default, Clone)]
struct Track {
    local: u8,
    remote: u8,
    confirmed: bool,
    emitted: Option<u8>,
}

impl Track {
    fn effective(&self) -> u8 {
        let cap = if self.confirmed {
            100
        } else {
            UNCONFIRMED_PERCENT_CAP
        };
        self.local.max(self.remote).min(cap)
    }

    /// Returns the new effective value when it changed since last emission.
    fn emit(&mut self) -> Option<u8> {
        let value = self.effective();
        if let Some(prev) = self.emitted {
            if value <= prev {
                return None;
            }
        }
        self.emitted = Some(value);
        Some(value)
    }
}

/// A change worth forwarding to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressChange {
    Overall(u8),
    File { file_id: String, percent: u8 },
}

#[derive(Debug, Default)]
pub struct ProgressAggregator {
    overall: Track,
    files: HashMap<String, Track>,
    total_files: usize,
    locally_completed: HashSet<String>,
    remote_files_completed: Option<usize>,
}

impl ProgressAggregator {
    pub fn new(file_ids: impl IntoIterator<Item = String>) -> Self {
        let files: HashMap<String, Track> = file_ids
            .into_iter()
            .map(|id| (id, Track::default()))
            .collect();
        Self {
            total_files: files.len(),
            files,
            ..Self::default()
        }
    }

    // ── Overall ──────────────────────────────────────────────────────────

    pub fn update_local(&mut self, percent: u8) -> Option<u8> {
        let percent = percent.min(100);
        if percent > self.overall.local {
            self.overall.local = percent;
        }
        self.overall.emit()
    }

    pub fn update_remote(&mut self, percent: u8) -> Option<u8> {
        let percent = percent.min(100);
        if percent > self.overall.remote {
            self.overall.remote = percent;
        }
        self.overall.emit()
    }

    /// The receiver confirmed the whole upload: everything goes to 100.
    pub fn confirm(&mut self) -> Vec<ProgressChange> {
        let mut changes = Vec::new();
        let mut ids: Vec<String> = self.files.keys().cloned().collect();
        ids.sort();
        for id in ids {
            if let Some(change) = self.confirm_file(&id) {
                changes.push(change);
            }
        }
        self.overall.confirmed = true;
        self.overall.remote = 100;
        if let Some(value) = self.overall.emit() {
            changes.push(ProgressChange::Overall(value));
        }
        changes
    }

    pub fn overall(&self) -> u8 {
        self.overall.effective()
    }

    // ── Per file ─────────────────────────────────────────────────────────

    pub fn update_file_local(&mut self, file_id: &str, percent: u8) -> Option<ProgressChange> {
        let track = self.files.get_mut(file_id)?;
        let percent = percent.min(100);
        if percent > track.local {
            track.local = percent;
        }
        if percent >= 100 {
            self.locally_completed.insert(file_id.to_string());
        }
        track.emit().map(|percent| ProgressChange::File {
            file_id: file_id.to_string(),
            percent,
        })
    }

    pub fn update_file_remote(&mut self, file_id: &str, percent: u8) -> Option<ProgressChange> {
        if percent >= 100 {
            return self.confirm_file(file_id);
        }
        let track = self.files.get_mut(file_id)?;
        if percent > track.remote {
            track.remote = percent;
        }
        track.emit().map(|percent| ProgressChange::File {
            file_id: file_id.to_string(),
            percent,
        })
    }

    fn confirm_file(&mut self, file_id: &str) -> Option<ProgressChange> {
        let track = self.files.get_mut(file_id)?;
        track.confirmed = true;
        track.remote = 100;
        track.emit().map(|percent| ProgressChange::File {
            file_id: file_id.to_string(),
            percent,
        })
    }

    pub fn file_percent(&self, file_id: &str) -> Option<u8> {
        self.files.get(file_id).map(Track::effective)
    }

    // ── File counts ──────────────────────────────────────────────────────

    pub fn set_remote_files_completed(&mut self, completed: usize) {
        let prev = self.remote_files_completed.unwrap_or(0);
        self.remote_files_completed = Some(prev.max(completed));
    }

    /// Remote count once the receiver reported anything, local count before.
    pub fn files_completed(&self) -> usize {
        self.remote_files_completed
            .unwrap_or(self.locally_completed.len())
            .min(self.total_files)
    }

    pub fn total_files(&self) -> usize {
        self.total_files
    }

    /// Stop counting a file that will never arrive.
    pub fn drop_file(&mut self, file_id: &str) {
        if self.files.remove(file_id).is_some() {
            self.total_files -= 1;
            self.locally_completed.remove(file_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_never_regresses_and_caps_at_99() {
        let mut agg = ProgressAggregator::new(vec!["a".to_string()]);
        let mut emitted = Vec::new();
        for (local, value) in [(true, 10), (false, 30), (true, 20), (true, 100), (false, 100)] {
            let out = if local {
                agg.update_local(value)
            } else {
                agg.update_remote(value)
            };
            emitted.extend(out);
        }
        assert_eq!(emitted, vec![10, 30, 99]);
        assert_eq!(agg.overall(), 99);

        let changes = agg.confirm();
        assert!(changes.contains(&ProgressChange::Overall(100)));
        assert_eq!(agg.overall(), 100);
    }

    #[test]
    fn duplicate_values_are_not_emitted() {
        let mut agg = ProgressAggregator::new(Vec::<String>::new());
        assert_eq!(agg.update_local(50), Some(50));
        assert_eq!(agg.update_local(50), None);
        assert_eq!(agg.update_remote(40), None);
        assert_eq!(agg.update_remote(51), Some(51));
    }

    #[test]
    fn remote_100_wins_per_file() {
        let mut agg = ProgressAggregator::new(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(
            agg.update_file_local("a", 100),
            Some(ProgressChange::File {
                file_id: "a".into(),
                percent: 99
            })
        );
        assert_eq!(
            agg.update_file_remote("a", 100),
            Some(ProgressChange::File {
                file_id: "a".into(),
                percent: 100
            })
        );
        assert_eq!(agg.update_file_remote("a", 40), None);
        assert_eq!(agg.file_percent("a"), Some(100));
        assert_eq!(agg.file_percent("b"), Some(0));
        assert_eq!(agg.update_file_local("zzz", 10), None);
    }

    #[test]
    fn files_completed_switches_to_remote_count() {
        let mut agg = ProgressAggregator::new(vec!["a".to_string(), "b".to_string()]);
        agg.update_file_local("a", 100);
        agg.update_file_local("b", 100);
        assert_eq!(agg.files_completed(), 2);

        agg.set_remote_files_completed(1);
        assert_eq!(agg.files_completed(), 1);
        agg.set_remote_files_completed(0);
        assert_eq!(agg.files_completed(), 1);
    }
}
