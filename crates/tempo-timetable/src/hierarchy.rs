use tempo_core::config::TempoConfig;
use tempo_core::{Qualifier, TimeperiodGrouping};

use crate::error::{Result, TimetableError};

#[derive(Debug, Clone)]
pub struct HierarchyEntry {
    pub process_name: String,
    pub qualifier: Qualifier,
    pub grouping: TimeperiodGrouping,
}

/// Processes of one tree ordered coarsest first (yearly, monthly, daily, hourly).
///
/// The position of an entry is its level in the tree: level 0 holds the
/// top-level nodes and the last level holds the leaves.
#[derive(Debug, Clone)]
pub struct ProcessHierarchy {
    entries: Vec<HierarchyEntry>,
}

impl ProcessHierarchy {
    pub fn new(config: &TempoConfig, process_names: &[String]) -> Result<Self> {
        let mut entries = process_names
            .iter()
            .map(|name| {
                let process = config
                    .processes
                    .get(name)
                    .ok_or_else(|| TimetableError::UnknownProcess(name.clone()))?;
                Ok(HierarchyEntry {
                    process_name: name.clone(),
                    qualifier: process.qualifier,
                    grouping: process.grouping()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by_key(|e| std::cmp::Reverse(e.qualifier.rank()));
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, process_name: &str) -> bool {
        self.level_of(process_name).is_some()
    }

    pub fn level_of(&self, process_name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.process_name == process_name)
    }

    pub fn entry(&self, level: usize) -> &HierarchyEntry {
        &self.entries[level]
    }

    pub fn by_qualifier(&self, qualifier: Qualifier) -> Option<&HierarchyEntry> {
        self.entries.iter().find(|e| e.qualifier == qualifier)
    }

    pub fn bottom_level(&self) -> usize {
        self.entries.len().saturating_sub(1)
    }

    pub fn bottom(&self) -> &HierarchyEntry {
        &self.entries[self.bottom_level()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &HierarchyEntry> {
        self.entries.iter()
    }
}
