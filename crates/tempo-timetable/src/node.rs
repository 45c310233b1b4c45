use std::collections::BTreeMap;

use tempo_core::Qualifier;
use tempo_store::Job;

/// Index of a node inside its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub process_name: String,
    pub timeperiod: String,
    pub qualifier: Qualifier,
    /// Position in the owning tree's hierarchy; 0 is the top level.
    pub level: usize,
    /// `None` for top-level nodes, which hang off the tree's virtual root.
    pub parent: Option<NodeId>,
    /// Keyed by timeperiod so iteration is chronological.
    pub children: BTreeMap<String, NodeId>,
    /// Lazily attached; every node carries one after validation.
    pub job: Option<Job>,
}

impl TreeNode {
    pub(crate) fn new(
        process_name: &str,
        timeperiod: &str,
        qualifier: Qualifier,
        level: usize,
        parent: Option<NodeId>,
    ) -> Self {
        Self {
            process_name: process_name.to_string(),
            timeperiod: timeperiod.to_string(),
            qualifier,
            level,
            parent,
            children: BTreeMap::new(),
            job: None,
        }
    }

    pub fn label(&self) -> String {
        format!("{}@{}", self.process_name, self.timeperiod)
    }
}

/// Buckets of counterpart nodes gathered across dependency trees.
///
/// Each bucket holds node labels; an empty bucket means the matching
/// predicate holds for every counterpart (and vacuously with none).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodesCompositeState {
    pub unfinished: Vec<String>,
    pub unprocessed: Vec<String>,
    pub unhealthy: Vec<String>,
    pub skipped: Vec<String>,
}

impl NodesCompositeState {
    pub fn enlist(&mut self, label: String, job: &Job) {
        if !job.is_finished() {
            self.unfinished.push(label.clone());
        }
        if !(job.is_processed() || job.is_noop()) {
            self.unprocessed.push(label.clone());
        }
        if !(job.is_active() || job.is_processed() || job.is_noop()) {
            self.unhealthy.push(label.clone());
        }
        if job.is_skipped() {
            self.skipped.push(label);
        }
    }

    pub fn all_finished(&self) -> bool {
        self.unfinished.is_empty()
    }

    pub fn all_processed(&self) -> bool {
        self.unprocessed.is_empty()
    }

    pub fn all_healthy(&self) -> bool {
        self.unhealthy.is_empty()
    }

    pub fn skipped_present(&self) -> bool {
        !self.skipped.is_empty()
    }
}
