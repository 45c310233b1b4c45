use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use tempo_core::config::{ProcessConfig, TempoConfig};
use tempo_core::time::{actual_timeperiod, cast_to_qualifier};
use tempo_core::{Clock, CoreError, Qualifier};
use tempo_store::{Job, JobCollection, JobState, RetryPolicy, Store, UnitOfWork};

use crate::error::{Result, TimetableError};
use crate::hierarchy::ProcessHierarchy;
use crate::node::{NodeId, NodesCompositeState, TreeNode};
use crate::state_machine::{Registry, StateMachine};
use crate::tree::{SkipPolicy, TimeperiodTree};

const COLLECTIONS: [Qualifier; 4] = [
    Qualifier::Hourly,
    Qualifier::Daily,
    Qualifier::Monthly,
    Qualifier::Yearly,
];

/// A node addressed across trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub tree: usize,
    pub node: NodeId,
}

/// Nodes already touched by one reprocess or skip cascade.
#[derive(Debug, Default)]
pub struct TxContext {
    visited: HashSet<NodeRef>,
}

impl TxContext {
    /// `false` when the node was already part of this cascade.
    fn visit(&mut self, node: NodeRef) -> bool {
        self.visited.insert(node)
    }

    pub fn len(&self) -> usize {
        self.visited.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visited.is_empty()
    }
}

/// Owner of every timeperiod tree and the only writer of job records.
///
/// Shared as `Arc<Mutex<Timetable>>`; state machines receive `&mut Timetable`
/// for the duration of one decision step.
pub struct Timetable {
    config: Arc<TempoConfig>,
    store: Arc<dyn Store>,
    machines: Registry,
    clock: Clock,
    policy: SkipPolicy,
    retry: RetryPolicy,
    trees: Vec<TimeperiodTree>,
    tree_names: HashMap<String, usize>,
    process_trees: HashMap<String, usize>,
}

impl Timetable {
    /// Build the trees from configuration, reload persisted job records,
    /// extend the trees to the present and validate them.
    pub fn new(
        config: Arc<TempoConfig>,
        store: Arc<dyn Store>,
        machines: Registry,
        clock: Clock,
    ) -> Result<Self> {
        let mut timetable = Self {
            policy: SkipPolicy::from_settings(&config.scheduler),
            retry: RetryPolicy::from_settings(&config.scheduler),
            config,
            store,
            machines,
            clock,
            trees: Vec::new(),
            tree_names: HashMap::new(),
            process_trees: HashMap::new(),
        };
        timetable.construct_trees()?;
        timetable.register_dependencies()?;
        timetable.load_tree()?;
        timetable.build_trees()?;
        timetable.validate()?;
        info!(trees = timetable.trees.len(), "timetable ready");
        Ok(timetable)
    }

    fn construct_trees(&mut self) -> Result<()> {
        let config = Arc::clone(&self.config);
        for (name, tree) in &config.trees {
            let hierarchy = ProcessHierarchy::new(&config, &tree.processes)?;
            let index = self.trees.len();
            for entry in hierarchy.iter() {
                self.process_trees.insert(entry.process_name.clone(), index);
            }
            self.trees.push(TimeperiodTree::new(name, hierarchy));
            self.tree_names.insert(name.clone(), index);
        }
        Ok(())
    }

    fn register_dependencies(&mut self) -> Result<()> {
        let config = Arc::clone(&self.config);
        for (name, tree) in &config.trees {
            let index = self.tree_names[name];
            for dependency in &tree.dependent_on {
                let target = *self
                    .tree_names
                    .get(dependency)
                    .ok_or_else(|| TimetableError::UnknownTree(dependency.clone()))?;
                self.trees[index].dependent_on.push(target);
            }
        }
        Ok(())
    }

    // ── accessors ──────────────────────────────────────────────────────────

    pub fn config(&self) -> &TempoConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn trees(&self) -> &[TimeperiodTree] {
        &self.trees
    }

    pub fn tree(&self, node: NodeRef) -> &TimeperiodTree {
        &self.trees[node.tree]
    }

    pub fn node(&self, node: NodeRef) -> &TreeNode {
        self.trees[node.tree].node(node.node)
    }

    pub fn process_config(&self, process_name: &str) -> Result<&ProcessConfig> {
        self.config
            .processes
            .get(process_name)
            .ok_or_else(|| TimetableError::UnknownProcess(process_name.to_string()))
    }

    /// Tree that manages `process_name`.
    pub fn get_tree(&self, process_name: &str) -> Result<&TimeperiodTree> {
        Ok(&self.trees[self.tree_index(process_name)?])
    }

    fn tree_index(&self, process_name: &str) -> Result<usize> {
        self.process_trees
            .get(process_name)
            .copied()
            .ok_or_else(|| TimetableError::UnknownProcess(process_name.to_string()))
    }

    pub fn state_machine_for(&self, process_name: &str) -> Result<Arc<dyn StateMachine>> {
        let kind = self.process_config(process_name)?.state_machine;
        self.machines
            .get(kind)
            .ok_or_else(|| TimetableError::UnsupportedStateMachine {
                process_name: process_name.to_string(),
                kind,
            })
    }

    /// Grouped timeperiod of `process_name` that contains the current instant.
    pub fn actual_timeperiod(&self, process_name: &str) -> Result<String> {
        let process = self.process_config(process_name)?;
        let raw = actual_timeperiod(process.qualifier, self.now());
        Ok(process.grouping()?.translate(&raw)?)
    }

    fn collection(&self, process_name: &str) -> Result<JobCollection> {
        let qualifier = self.process_config(process_name)?.qualifier;
        JobCollection::for_qualifier(qualifier).ok_or_else(|| {
            TimetableError::Core(CoreError::UnsupportedQualifier {
                qualifier: qualifier.to_string(),
                operation: "job records",
            })
        })
    }

    /// Node for `(process_name, timeperiod)`, created when missing.
    pub fn locate(&mut self, process_name: &str, timeperiod: &str) -> Result<NodeRef> {
        let tree = self.tree_index(process_name)?;
        let node = self.trees[tree].get_node(process_name, timeperiod)?;
        Ok(NodeRef { tree, node })
    }

    fn job_mut(&mut self, node: NodeRef) -> Result<&mut Job> {
        self.assign_job_record(node)?;
        let tree_node = self.trees[node.tree].node_mut(node.node);
        match tree_node.job {
            Some(ref mut job) => Ok(job),
            None => Err(TimetableError::Detached {
                process_name: tree_node.process_name.clone(),
                timeperiod: tree_node.timeperiod.clone(),
            }),
        }
    }

    fn stamp(&self, message: &str) -> String {
        format!("{} {message}", self.now().format("%Y-%m-%d %H:%M:%S"))
    }

    // ── tree lifecycle ─────────────────────────────────────────────────────

    /// Attach persisted job records to the trees, per partition, starting at
    /// the configured floor.
    pub fn load_tree(&mut self) -> Result<()> {
        let floor = self.config.scheduler.start_timeperiod.clone();
        let (mut loaded, mut orphaned) = (0usize, 0usize);
        for qualifier in COLLECTIONS {
            let Some(collection) = JobCollection::for_qualifier(qualifier) else {
                continue;
            };
            let since = match &floor {
                Some(floor) => cast_to_qualifier(qualifier, floor)?,
                None => String::new(),
            };
            for job in self.store.get_jobs(collection, &since)? {
                match self.process_trees.get(&job.process_name) {
                    Some(&tree) => {
                        self.trees[tree].update_node(job)?;
                        loaded += 1;
                    }
                    None => orphaned += 1,
                }
            }
        }
        info!(loaded, "job records loaded into trees");
        if orphaned > 0 {
            warn!(orphaned, "job records for processes outside any tree were ignored");
        }
        Ok(())
    }

    pub fn build_trees(&mut self) -> Result<()> {
        let floor = self.config.scheduler.start_timeperiod.clone();
        let now = self.now();
        for tree in &mut self.trees {
            tree.build_tree(floor.as_deref(), now)?;
            debug!(tree = tree.name(), nodes = tree.len(), "tree built");
        }
        Ok(())
    }

    /// Extend the tree of `process_name` to the present.
    pub fn build_tree_for(&mut self, process_name: &str) -> Result<()> {
        let floor = self.config.scheduler.start_timeperiod.clone();
        let now = self.now();
        let tree = self.tree_index(process_name)?;
        self.trees[tree].build_tree(floor.as_deref(), now)
    }

    /// Validate every node of every tree, attaching missing job records and
    /// repairing parent/child state mismatches.
    pub fn validate(&mut self) -> Result<()> {
        for tree in 0..self.trees.len() {
            let roots: Vec<NodeId> = self.trees[tree].roots().collect();
            for node in roots {
                self.validate_node(NodeRef { tree, node })?;
            }
            let now = self.now();
            self.trees[tree].mark_validated(now);
            info!(tree = self.trees[tree].name(), "tree validated");
        }
        Ok(())
    }

    fn validate_node(&mut self, node: NodeRef) -> Result<()> {
        self.assign_job_record(node)?;
        let has_younger_sibling = self.trees[node.tree].has_younger_sibling(node.node);

        let children: Vec<NodeId> = self.node(node).children.values().copied().collect();
        let mut all_children_finished = true;
        let mut all_children_skipped = true;
        for &child in &children {
            let child = NodeRef { tree: node.tree, node: child };
            self.validate_node(child)?;
            let state = self.job_mut(child)?.state;
            if state.is_active() {
                all_children_finished = false;
            }
            if state != JobState::Skipped {
                all_children_skipped = false;
            }
        }

        if !all_children_finished && self.job_mut(node)?.is_finished() {
            let label = self.node(node).label();
            info!(node = %label, "finished node has unfinished children; reprocessing");
            self.reprocess_tree_node(node, &mut TxContext::default())?;
        }

        if !children.is_empty()
            && all_children_skipped
            && self.trees[node.tree].build_timeperiod().is_some()
            && has_younger_sibling
            && !self.job_mut(node)?.is_skipped()
        {
            info!(node = %self.node(node).label(), "all children skipped; skipping node");
            self.skip_tree_node(node, &mut TxContext::default())?;
        }
        Ok(())
    }

    // ── job records ────────────────────────────────────────────────────────

    /// Attach the persisted job record to `node`, creating an EMBRYO record
    /// when none exists yet.
    pub fn assign_job_record(&mut self, node: NodeRef) -> Result<()> {
        if self.node(node).job.is_some() {
            return Ok(());
        }
        let (process_name, timeperiod) = {
            let n = self.node(node);
            (n.process_name.clone(), n.timeperiod.clone())
        };
        let collection = self.collection(&process_name)?;
        let job = match self.store.get_job(collection, &process_name, &timeperiod) {
            Ok(job) => job,
            Err(e) if e.is_not_found() => {
                let mut job = Job::embryo(&process_name, &timeperiod);
                job.id = Some(self.store.update_job(collection, &job)?);
                debug!(
                    process = %process_name,
                    timeperiod = %timeperiod,
                    "created embryo job record"
                );
                job
            }
            Err(e) => return Err(e.into()),
        };
        self.trees[node.tree].node_mut(node.node).job = Some(job);
        Ok(())
    }

    /// Job record of the node selected for the next processing step.
    #[instrument(skip(self))]
    pub fn get_next_job_record(&mut self, process_name: &str) -> Result<Job> {
        let tree = self.tree_index(process_name)?;
        let now = self.now();
        let node = self.trees[tree].get_next_node(process_name, &self.policy, now)?;
        Ok(self.job_mut(NodeRef { tree, node })?.clone())
    }

    /// Current job record for `(process_name, timeperiod)`.
    pub fn job_record(&mut self, process_name: &str, timeperiod: &str) -> Result<Job> {
        let node = self.locate(process_name, timeperiod)?;
        Ok(self.job_mut(node)?.clone())
    }

    /// Point `job` at `uow`, move it to `state` and persist it.
    pub fn update_job_record(
        &mut self,
        job: &mut Job,
        uow: &UnitOfWork,
        state: JobState,
    ) -> Result<()> {
        job.state = state;
        job.related_unit_of_work = uow.id;
        self.update_job_state(job)
    }

    /// Persist `job` and refresh the tree node that carries it.
    pub fn update_job_state(&mut self, job: &mut Job) -> Result<()> {
        let collection = self.collection(&job.process_name)?;
        job.id = Some(self.store.update_job(collection, job)?);
        let tree = self.tree_index(&job.process_name)?;
        self.trees[tree].update_node(job.clone())?;
        info!(
            process = %job.process_name,
            timeperiod = %job.timeperiod,
            state = %job.state,
            "job record updated"
        );
        Ok(())
    }

    /// Record `message` on both the caller's copy of the job and the copy
    /// cached in the tree, so neither loses it when the other is persisted.
    pub fn add_log_entry(&mut self, job: &mut Job, message: &str) -> Result<()> {
        let entry = self.stamp(message);
        let node = self.locate(&job.process_name, &job.timeperiod)?;
        self.job_mut(node)?.add_log_entry(entry.clone());
        job.add_log_entry(entry);
        Ok(())
    }

    /// Count a processing failure and let the tree decide whether the node
    /// is still worth retrying.
    pub fn failed_on_processing_job_record(
        &mut self,
        process_name: &str,
        timeperiod: &str,
        reason: &str,
    ) -> Result<()> {
        let node = self.locate(process_name, timeperiod)?;
        let entry = self.stamp(reason);
        {
            let job = self.job_mut(node)?;
            job.number_of_failures += 1;
            job.add_log_entry(entry);
        }

        let now = self.now();
        if self.trees[node.tree].should_skip(node.node, &self.policy, now) {
            warn!(
                process = %process_name,
                timeperiod = %timeperiod,
                "failure ceiling reached; skipping"
            );
            self.skip_tree_node(node, &mut TxContext::default())?;
        } else {
            let mut job = self.job_mut(node)?.clone();
            self.update_job_state(&mut job)?;
        }
        Ok(())
    }

    // ── finalization and dependencies ──────────────────────────────────────

    /// Whether the job's window can be closed: every dependency counterpart
    /// finished, every child finished, the job itself still active.
    pub fn is_job_record_finalizable(&mut self, job: &mut Job) -> Result<bool> {
        let node = self.locate(&job.process_name, &job.timeperiod)?;
        let (finalizable, blocker) = self.node_finalizable(node)?;
        if let Some(entry) = blocker {
            job.add_log_entry(entry);
        }
        Ok(finalizable)
    }

    pub fn is_node_finalizable(&mut self, node: NodeRef) -> Result<bool> {
        Ok(self.node_finalizable(node)?.0)
    }

    fn node_finalizable(&mut self, node: NodeRef) -> Result<(bool, Option<String>)> {
        let composite = self.dependent_on_state(node)?;
        if !composite.all_finished() {
            let label = self.node(node).label();
            info!(
                node = %label,
                blockers = ?composite.unfinished,
                "blocked by unfinished dependencies"
            );
            let entry = self.stamp(&format!(
                "{label} is blocked by unfinished: {}",
                composite.unfinished.join(", ")
            ));
            self.job_mut(node)?.add_log_entry(entry.clone());
            return Ok((false, Some(entry)));
        }

        let children: Vec<NodeId> = self.node(node).children.values().copied().collect();
        for child in children {
            if !self.job_mut(NodeRef { tree: node.tree, node: child })?.is_finished() {
                return Ok((false, None));
            }
        }
        Ok((self.job_mut(node)?.is_active(), None))
    }

    /// Composite state of the job's counterparts in the trees its tree
    /// depends on.
    pub fn dependent_on_composite_state(&mut self, job: &Job) -> Result<NodesCompositeState> {
        let node = self.locate(&job.process_name, &job.timeperiod)?;
        self.dependent_on_state(node)
    }

    fn dependent_on_state(&mut self, node: NodeRef) -> Result<NodesCompositeState> {
        let dependencies = self.trees[node.tree].dependent_on.clone();
        let mut composite = NodesCompositeState::default();
        for tree in dependencies {
            let Some(counterpart) = self.counterpart_in(node, tree)? else {
                continue;
            };
            let label = format!("{}/{}", self.trees[tree].name(), self.node(counterpart).label());
            let job = self.job_mut(counterpart)?;
            composite.enlist(label, job);
        }
        Ok(composite)
    }

    /// Node of `tree` at the same qualifier and timeperiod as `node`; `None`
    /// when `tree` has no process of that qualifier.
    fn counterpart_in(&mut self, node: NodeRef, tree: usize) -> Result<Option<NodeRef>> {
        let (qualifier, timeperiod) = {
            let n = self.node(node);
            (n.qualifier, n.timeperiod.clone())
        };
        let Some(entry) = self.trees[tree].hierarchy().by_qualifier(qualifier) else {
            return Ok(None);
        };
        let process_name = entry.process_name.clone();
        let counterpart = self.trees[tree].get_node(&process_name, &timeperiod)?;
        Ok(Some(NodeRef { tree, node: counterpart }))
    }

    /// Counterparts of `node` in every tree that depends on its tree.
    fn dependant_nodes(&mut self, node: NodeRef) -> Result<Vec<NodeRef>> {
        let dependants: Vec<usize> = (0..self.trees.len())
            .filter(|&t| self.trees[t].dependent_on.contains(&node.tree))
            .collect();
        let mut nodes = Vec::new();
        for tree in dependants {
            if let Some(counterpart) = self.counterpart_in(node, tree)? {
                nodes.push(counterpart);
            }
        }
        Ok(nodes)
    }

    // ── cascades ───────────────────────────────────────────────────────────

    /// Reopen `node`, its ancestors and its cross-tree dependants.
    ///
    /// A pristine EMBRYO node is left untouched but the cascade still walks
    /// through it.
    pub fn reprocess_tree_node(&mut self, node: NodeRef, tx: &mut TxContext) -> Result<()> {
        if !tx.visit(node) {
            return Ok(());
        }
        let mut job = self.job_mut(node)?.clone();
        if !(job.state == JobState::Embryo && job.number_of_failures == 0) {
            let machine = self.state_machine_for(&job.process_name)?;
            machine.reprocess_job(self, &mut job)?;
        }

        if let Some(parent) = self.node(node).parent {
            self.reprocess_tree_node(NodeRef { tree: node.tree, node: parent }, tx)?;
        }
        for dependant in self.dependant_nodes(node)? {
            self.reprocess_tree_node(dependant, tx)?;
        }
        Ok(())
    }

    /// Skip `node`, its descendants and its cross-tree dependants. Nodes
    /// that already finished keep their state.
    pub fn skip_tree_node(&mut self, node: NodeRef, tx: &mut TxContext) -> Result<()> {
        if !tx.visit(node) {
            return Ok(());
        }
        let mut job = self.job_mut(node)?.clone();
        if !job.is_finished() {
            let machine = self.state_machine_for(&job.process_name)?;
            machine.skip_job(self, &mut job)?;
        }

        let children: Vec<NodeId> = self.node(node).children.values().copied().collect();
        for child in children {
            self.skip_tree_node(NodeRef { tree: node.tree, node: child }, tx)?;
        }
        for dependant in self.dependant_nodes(node)? {
            self.skip_tree_node(dependant, tx)?;
        }
        Ok(())
    }
}
