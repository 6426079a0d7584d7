use std::{collections::HashSet, hash::Hash};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub processed: u64,
    pub total: u64,
    /// Always within `[0, 1]`.
    pub progress: f64,
}

impl ProgressSnapshot {
    pub fn is_complete(&self) -> bool {
        self.progress >= 1.0
    }
}

fn ratio(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    let r = processed as f64 / total as f64;
    if r.is_finite() { r.clamp(0.0, 1.0) } else { 0.0 }
}

/// Running tally over a known manifest of named units (e.g. runtime files).
///
/// Completion order does not matter; duplicates and names outside the
/// manifest are ignored.
#[derive(Debug, Clone)]
pub struct UnitProgress<K> {
    total: Option<HashSet<K>>,
    completed: HashSet<K>,
    early: HashSet<K>,
    last: f64,
}

impl<K: Eq + Hash + Clone> Default for UnitProgress<K> {
    fn default() -> Self {
        Self {
            total: None,
            completed: HashSet::new(),
            early: HashSet::new(),
            last: 0.0,
        }
    }
}

impl<K: Eq + Hash + Clone> UnitProgress<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_manifest(units: impl IntoIterator<Item = K>) -> Self {
        let mut p = Self::new();
        p.set_manifest(units);
        p
    }

    /// Completions reported before the manifest was known are replayed here.
    pub fn set_manifest(&mut self, units: impl IntoIterator<Item = K>) -> ProgressSnapshot {
        let total: HashSet<K> = units.into_iter().collect();
        for unit in std::mem::take(&mut self.early) {
            if total.contains(&unit) {
                self.completed.insert(unit);
            }
        }
        self.total = Some(total);
        self.snapshot()
    }

    pub fn complete(&mut self, unit: K) -> ProgressSnapshot {
        match &self.total {
            Some(total) => {
                if total.contains(&unit) {
                    self.completed.insert(unit);
                }
            }
            None => {
                self.early.insert(unit);
            }
        }
        self.snapshot()
    }

    pub fn is_complete(&self) -> bool {
        self.total
            .as_ref()
            .is_some_and(|t| self.completed.len() >= t.len())
    }

    pub fn snapshot(&mut self) -> ProgressSnapshot {
        let Some(total) = &self.total else {
            return ProgressSnapshot {
                processed: 0,
                total: 0,
                progress: 0.0,
            };
        };
        let processed = self.completed.len() as u64;
        let total = total.len() as u64;
        self.last = self.last.max(ratio(processed, total));
        ProgressSnapshot {
            processed,
            total,
            progress: self.last,
        }
    }
}

/// Byte (or item count) based progress for transfers and file operations.
///
/// The remote side occasionally reports one byte more than the total, or a
/// smaller count after a larger one; neither moves the value backwards or
/// above 1.
#[derive(Debug, Clone, Default)]
pub struct TransferProgress {
    processed: u64,
    total: Option<u64>,
    last: f64,
}

impl TransferProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, processed: u64, total: u64) -> ProgressSnapshot {
        self.processed = self.processed.max(processed);
        self.total = Some(total);
        self.snapshot()
    }

    pub fn finish(&mut self) -> ProgressSnapshot {
        let total = self.total.unwrap_or(self.processed).max(self.processed);
        self.processed = total;
        self.total = Some(total);
        self.last = 1.0;
        self.snapshot()
    }

    pub fn snapshot(&mut self) -> ProgressSnapshot {
        let Some(total) = self.total else {
            return ProgressSnapshot {
                processed: self.processed,
                total: 0,
                progress: 0.0,
            };
        };
        self.last = self.last.max(ratio(self.processed, total));
        ProgressSnapshot {
            processed: self.processed,
            total,
            progress: self.last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_manifest_reports_zero() {
        let mut p = UnitProgress::<String>::new();
        let s = p.complete("bin/java".to_string());
        assert_eq!(s.progress, 0.0);
        assert!(!p.is_complete());
    }

    #[test]
    fn empty_manifest_is_complete() {
        let mut p = UnitProgress::<String>::new();
        let s = p.set_manifest(Vec::new());
        assert_eq!(s.progress, 1.0);
        assert!(!s.progress.is_nan());
        assert!(p.is_complete());
    }

    #[test]
    fn out_of_order_and_duplicate_completions() {
        let mut p = UnitProgress::with_manifest(["a", "b", "c", "d"]);
        assert_eq!(p.complete("c").progress, 0.25);
        assert_eq!(p.complete("a").progress, 0.5);
        assert_eq!(p.complete("a").progress, 0.5);
        assert_eq!(p.complete("zzz").progress, 0.5);
        assert_eq!(p.complete("d").progress, 0.75);
        let s = p.complete("b");
        assert_eq!(s.progress, 1.0);
        assert_eq!((s.processed, s.total), (4, 4));
        assert!(p.is_complete());
    }

    #[test]
    fn early_completions_replay_after_manifest() {
        let mut p = UnitProgress::new();
        p.complete("a");
        p.complete("x");
        let s = p.set_manifest(["a", "b"]);
        assert_eq!(s.progress, 0.5);
    }

    #[test]
    fn transfer_progress_clamps_and_never_decreases() {
        let mut p = TransferProgress::new();
        assert_eq!(p.snapshot().progress, 0.0);
        assert_eq!(p.update(50, 200).progress, 0.25);
        assert_eq!(p.update(40, 200).progress, 0.25);
        assert_eq!(p.update(201, 200).progress, 1.0);
        assert_eq!(p.finish().progress, 1.0);
    }

    #[test]
    fn transfer_zero_total_is_complete() {
        let mut p = TransferProgress::new();
        assert_eq!(p.update(0, 0).progress, 1.0);
    }
}
