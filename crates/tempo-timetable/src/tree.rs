use std::collections::BTreeMap;
use std::ops::Bound;

use chrono::{DateTime, Duration, Utc};
use tempo_core::config::SchedulerSettings;
use tempo_core::time::{actual_timeperiod, cast_to_qualifier, increment, to_datetime};
use tempo_store::Job;

use crate::error::{Result, TimetableError};
use crate::hierarchy::ProcessHierarchy;
use crate::node::{NodeId, TreeNode};

/// Thresholds that decide when a node is no longer worth processing.
#[derive(Debug, Clone, Copy)]
pub struct SkipPolicy {
    pub max_failures: u32,
    /// Fresh leaves are never given up on while younger than this.
    pub life_support: Duration,
}

impl SkipPolicy {
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self {
            max_failures: settings.max_number_of_failures,
            life_support: Duration::hours(settings.life_support_hours),
        }
    }
}

/// Hierarchical timeperiod tree for one set of processes.
///
/// Nodes live in an arena indexed by [`NodeId`]; parents and children refer
/// to each other by id. Top-level nodes hang off `roots`.
#[derive(Debug)]
pub struct TimeperiodTree {
    name: String,
    hierarchy: ProcessHierarchy,
    nodes: Vec<TreeNode>,
    roots: BTreeMap<String, NodeId>,
    pub(crate) dependent_on: Vec<usize>,
    build_timeperiod: Option<String>,
    validation_timestamp: Option<DateTime<Utc>>,
}

impl TimeperiodTree {
    pub fn new(name: &str, hierarchy: ProcessHierarchy) -> Self {
        Self {
            name: name.to_string(),
            hierarchy,
            nodes: Vec::new(),
            roots: BTreeMap::new(),
            dependent_on: Vec::new(),
            build_timeperiod: None,
            validation_timestamp: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hierarchy(&self) -> &ProcessHierarchy {
        &self.hierarchy
    }

    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut TreeNode {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.roots.values().copied()
    }

    pub fn build_timeperiod(&self) -> Option<&str> {
        self.build_timeperiod.as_deref()
    }

    pub fn validation_timestamp(&self) -> Option<DateTime<Utc>> {
        self.validation_timestamp
    }

    pub(crate) fn mark_validated(&mut self, at: DateTime<Utc>) {
        self.validation_timestamp = Some(at);
    }

    /// Node for `(process_name, timeperiod)`, created with its ancestors
    /// when missing. The timeperiod is translated through the process
    /// grouping first.
    pub fn get_node(&mut self, process_name: &str, timeperiod: &str) -> Result<NodeId> {
        let level = self.level_of(process_name)?;
        self.node_at(level, timeperiod)
    }

    /// Lookup without creating anything.
    pub fn find_node(&self, process_name: &str, timeperiod: &str) -> Option<NodeId> {
        let level = self.hierarchy.level_of(process_name)?;
        let key = self.hierarchy.entry(level).grouping.translate(timeperiod).ok()?;
        let parent = if level == 0 {
            None
        } else {
            let upper = self.hierarchy.entry(level - 1);
            let cast = cast_to_qualifier(upper.qualifier, &key).ok()?;
            Some(self.find_node(&upper.process_name, &cast)?)
        };
        self.children_of(parent).get(&key).copied()
    }

    fn level_of(&self, process_name: &str) -> Result<usize> {
        self.hierarchy
            .level_of(process_name)
            .ok_or_else(|| TimetableError::UnknownProcess(process_name.to_string()))
    }

    fn node_at(&mut self, level: usize, timeperiod: &str) -> Result<NodeId> {
        let entry = self.hierarchy.entry(level);
        let key = entry.grouping.translate(timeperiod)?;
        let (process_name, qualifier) = (entry.process_name.clone(), entry.qualifier);

        let parent = if level == 0 {
            None
        } else {
            let upper = self.hierarchy.entry(level - 1).qualifier;
            Some(self.node_at(level - 1, &cast_to_qualifier(upper, &key)?)?)
        };
        if let Some(&id) = self.children_of(parent).get(&key) {
            return Ok(id);
        }

        let id = NodeId(self.nodes.len());
        self.nodes
            .push(TreeNode::new(&process_name, &key, qualifier, level, parent));
        self.children_of_mut(parent).insert(key, id);
        Ok(id)
    }

    fn children_of(&self, parent: Option<NodeId>) -> &BTreeMap<String, NodeId> {
        match parent {
            Some(p) => &self.nodes[p.0].children,
            None => &self.roots,
        }
    }

    fn children_of_mut(&mut self, parent: Option<NodeId>) -> &mut BTreeMap<String, NodeId> {
        match parent {
            Some(p) => &mut self.nodes[p.0].children,
            None => &mut self.roots,
        }
    }

    /// Next sibling in chronological order, if any.
    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        let node = &self.nodes[id.0];
        self.children_of(node.parent)
            .range::<str, _>((Bound::Excluded(node.timeperiod.as_str()), Bound::Unbounded))
            .next()
            .map(|(_, &next)| next)
    }

    pub fn has_younger_sibling(&self, id: NodeId) -> bool {
        self.next_sibling(id).is_some()
    }

    /// Attach `job` to its node, creating the node when missing.
    pub fn update_node(&mut self, job: Job) -> Result<NodeId> {
        let id = self.get_node(&job.process_name, &job.timeperiod)?;
        self.nodes[id.0].job = Some(job);
        Ok(id)
    }

    /// Extend the tree so it covers every bottom-level timeperiod from the
    /// last build (or `floor` on the first build) up to the one holding `now`.
    pub fn build_tree(&mut self, floor: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        let level = self.hierarchy.bottom_level();
        let qualifier = self.hierarchy.bottom().qualifier;
        let actual = actual_timeperiod(qualifier, now);

        let start = match (&self.build_timeperiod, floor) {
            (Some(built), _) => built.clone(),
            (None, Some(floor)) => floor.to_string(),
            (None, None) => actual.clone(),
        };
        let mut timeperiod = cast_to_qualifier(qualifier, &start)?;
        while timeperiod <= actual {
            self.node_at(level, &timeperiod)?;
            timeperiod = increment(qualifier, &timeperiod, 1)?;
        }
        self.build_timeperiod = Some(actual);
        Ok(())
    }

    /// Whether `id` should no longer be selected for processing.
    ///
    /// Finished nodes are skipped. A fresh leaf stays on life support
    /// regardless of failures; an older leaf is abandoned once it exceeds
    /// the failure ceiling. An interior node is abandoned only when every
    /// child is either skipped or over the ceiling.
    pub fn should_skip(&self, id: NodeId, policy: &SkipPolicy, now: DateTime<Utc>) -> bool {
        let node = &self.nodes[id.0];
        let Some(job) = &node.job else {
            return false;
        };
        if job.is_finished() {
            return true;
        }

        if node.level == self.hierarchy.bottom_level() && node.children.is_empty() {
            if let Ok(start) = to_datetime(&node.timeperiod) {
                if now - start < policy.life_support {
                    return false;
                }
            }
            return job.number_of_failures > policy.max_failures;
        }

        node.children
            .values()
            .all(|child| match &self.nodes[child.0].job {
                Some(j) => j.number_of_failures > policy.max_failures || j.is_skipped(),
                None => false,
            })
    }

    /// The earliest node of `process_name` still worth processing.
    ///
    /// Walks down from the top level, choosing at each level the first child
    /// that is unassigned or active and not skippable, spilling over to the
    /// parent's younger siblings. Falls back to the node of the current
    /// actual timeperiod. A returned node may still lack a job record.
    pub fn get_next_node(
        &mut self,
        process_name: &str,
        policy: &SkipPolicy,
        now: DateTime<Utc>,
    ) -> Result<NodeId> {
        let level = self.level_of(process_name)?;
        self.next_node_at(level, policy, now)
    }

    fn next_node_at(
        &mut self,
        level: usize,
        policy: &SkipPolicy,
        now: DateTime<Utc>,
    ) -> Result<NodeId> {
        let mut parent = if level == 0 {
            None
        } else {
            Some(self.next_node_at(level - 1, policy, now)?)
        };

        loop {
            for &child in self.children_of(parent).values() {
                match &self.nodes[child.0].job {
                    None => return Ok(child),
                    Some(_) if self.should_skip(child, policy, now) => continue,
                    Some(job) if job.is_active() => return Ok(child),
                    Some(_) => {}
                }
            }
            match parent.and_then(|p| self.next_sibling(p)) {
                Some(next) => parent = Some(next),
                None => break,
            }
        }

        let qualifier = self.hierarchy.entry(level).qualifier;
        self.node_at(level, &actual_timeperiod(qualifier, now))
    }
}
