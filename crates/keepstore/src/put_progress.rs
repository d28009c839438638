//! Replication accounting for a single block write.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::error;

use crate::error::{KeepError, KeepResult};
use crate::mount::Mount;

/// Tracks which storage classes and how many replicas one write has reached.
///
/// Each mount may be counted at most once. Counting a mount twice, or
/// removing one that was never counted, is reported as
/// [`KeepError::AccountingBug`] and leaves the state unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutProgress {
    class_needed: BTreeSet<String>,
    class_todo: BTreeSet<String>,
    mount_used: HashSet<String>,
    total_replication: u32,
    class_done: BTreeMap<String, u32>,
}

impl PutProgress {
    /// Start tracking a write that must reach every class in `classes`.
    /// An empty list accepts any mount.
    pub fn new<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let class_needed: BTreeSet<String> = classes.into_iter().map(Into::into).collect();
        Self {
            class_todo: class_needed.clone(),
            class_needed,
            ..Default::default()
        }
    }

    /// Count a successful write to `mount`.
    pub fn add(&mut self, mount: &Mount) -> KeepResult<()> {
        if self.mount_used.contains(&mount.uuid) {
            error!(mount = %mount.uuid, "BUG: replication already counted for mount");
            return Err(KeepError::AccountingBug {
                op: "add",
                mount: mount.uuid.clone(),
            });
        }
        self.mount_used.insert(mount.uuid.clone());
        self.total_replication += mount.replication;
        for class in &mount.storage_classes {
            *self.class_done.entry(class.clone()).or_insert(0) += mount.replication;
            self.class_todo.remove(class);
        }
        Ok(())
    }

    /// Undo an earlier [`PutProgress::add`] for `mount`.
    pub fn sub(&mut self, mount: &Mount) -> KeepResult<()> {
        if !self.mount_used.remove(&mount.uuid) {
            error!(mount = %mount.uuid, "BUG: removing replication that was never counted");
            return Err(KeepError::AccountingBug {
                op: "sub",
                mount: mount.uuid.clone(),
            });
        }
        self.total_replication = self.total_replication.saturating_sub(mount.replication);
        for class in &mount.storage_classes {
            let remaining = match self.class_done.get_mut(class) {
                Some(done) => {
                    *done = done.saturating_sub(mount.replication);
                    *done
                }
                None => 0,
            };
            if remaining == 0 {
                self.class_done.remove(class);
                if self.class_needed.contains(class) {
                    self.class_todo.insert(class.clone());
                }
            }
        }
        Ok(())
    }

    /// True once every requested class has a replica and at least one copy exists.
    pub fn done(&self) -> bool {
        self.class_todo.is_empty() && self.total_replication > 0
    }

    /// True if writing to `mount` would move this write closer to done.
    pub fn want(&self, mount: &Mount) -> bool {
        if self.done() || self.mount_used.contains(&mount.uuid) {
            return false;
        }
        self.class_todo.is_empty() || mount.storage_classes.iter().any(|c| self.class_todo.contains(c))
    }

    /// True if `mount` has been counted.
    pub fn used(&self, mount: &Mount) -> bool {
        self.mount_used.contains(&mount.uuid)
    }

    /// Replicas stored so far.
    pub fn total_replication(&self) -> u32 {
        self.total_replication
    }

    /// Replicas per storage class.
    pub fn class_done(&self) -> &BTreeMap<String, u32> {
        &self.class_done
    }

    /// Requested classes that still have no replica.
    pub fn missing_classes(&self) -> Vec<String> {
        self.class_todo.iter().cloned().collect()
    }

    /// Confirmed classes formatted as `A=1, B=1`.
    pub fn class_replication_header(&self) -> String {
        self.class_done
            .iter()
            .map(|(class, n)| format!("{}={}", class, n))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeConfig;
    use crate::volume::MemoryVolume;
    use std::sync::Arc;

    fn mount(uuid: &str, classes: &[&str], replication: u32) -> Mount {
        let mut config = VolumeConfig::memory(uuid).with_classes(classes.iter().copied());
        config.replication = replication;
        Mount::new(&config, Arc::new(MemoryVolume::new(uuid)), 0)
    }

    #[test]
    fn test_any_class_done_after_one_replica() {
        let a = mount("a", &["A"], 1);
        let mut pr = PutProgress::new(Vec::<String>::new());
        assert!(!pr.done());
        assert!(pr.want(&a));
        pr.add(&a).unwrap();
        assert!(pr.done());
        assert_eq!(pr.total_replication(), 1);
    }

    #[test]
    fn test_requested_classes_need_all() {
        let a = mount("a", &["A"], 1);
        let b = mount("b", &["B"], 1);
        let mut pr = PutProgress::new(["A", "B"]);
        pr.add(&a).unwrap();
        assert!(!pr.done());
        assert!(!pr.want(&a));
        assert!(pr.want(&b));
        pr.add(&b).unwrap();
        assert!(pr.done());
        assert_eq!(pr.class_replication_header(), "A=1, B=1");
    }

    #[test]
    fn test_unrelated_mount_not_wanted() {
        let c = mount("c", &["C"], 1);
        let pr = PutProgress::new(["A"]);
        assert!(!pr.want(&c));
    }

    #[test]
    fn test_double_add_is_a_bug() {
        let a = mount("a", &["A"], 2);
        let mut pr = PutProgress::new(["A"]);
        pr.add(&a).unwrap();
        let before = pr.clone();
        let err = pr.add(&a).unwrap_err();
        assert!(matches!(err, KeepError::AccountingBug { op: "add", .. }));
        assert_eq!(pr, before);
        assert_eq!(pr.total_replication(), 2);
    }

    #[test]
    fn test_sub_without_add_is_a_bug() {
        let a = mount("a", &["A"], 1);
        let mut pr = PutProgress::new(["A"]);
        let err = pr.sub(&a).unwrap_err();
        assert!(matches!(err, KeepError::AccountingBug { op: "sub", .. }));
        assert_eq!(pr.total_replication(), 0);
    }

    #[test]
    fn test_sub_reopens_needed_class() {
        let a = mount("a", &["A", "X"], 1);
        let mut pr = PutProgress::new(["A"]);
        pr.add(&a).unwrap();
        assert!(pr.done());
        pr.sub(&a).unwrap();
        assert!(!pr.done());
        assert_eq!(pr.missing_classes(), vec!["A".to_string()]);
        assert!(pr.class_done().is_empty());
        assert!(pr.want(&a));
    }

    #[test]
    fn test_sub_keeps_class_covered_by_other_mount() {
        let a1 = mount("a1", &["A"], 1);
        let a2 = mount("a2", &["A"], 1);
        let mut pr = PutProgress::new(["A"]);
        pr.add(&a1).unwrap();
        pr.add(&a2).unwrap();
        pr.sub(&a2).unwrap();
        assert!(pr.done());
        assert_eq!(pr.class_done().get("A"), Some(&1));
    }

    #[test]
    fn test_unrequested_classes_are_reported() {
        let ab = mount("ab", &["A", "B"], 2);
        let mut pr = PutProgress::new(["A"]);
        pr.add(&ab).unwrap();
        assert_eq!(pr.class_replication_header(), "A=2, B=2");
    }

    #[test]
    fn test_clone_is_independent() {
        let a = mount("a", &["A"], 1);
        let pr = PutProgress::new(["A"]);
        let mut pending = pr.clone();
        pending.add(&a).unwrap();
        assert!(pending.used(&a));
        assert!(!pr.used(&a));
    }
}
