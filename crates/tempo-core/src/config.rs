use std::collections::{BTreeMap, BTreeSet};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::grouping::TimeperiodGrouping;
use crate::time::{self, Qualifier};

pub const MAX_NUMBER_OF_FAILURES: u32 = 3;
pub const LIFE_SUPPORT_HOURS: i64 = 48;
pub const LAG_MINUTES: i64 = 5;
pub const PERSISTENCE_RETRIES: u32 = 20;
pub const RETRY_DELAY_MS: u64 = 250;
pub const HOUSEKEEPING_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_TRIGGER_INTERVAL_SECS: u64 = 60;

/// Top-level config (tempo.toml + TEMPO_* env overrides).
///
/// Read once at startup and shared by `Arc`; changing it requires a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TempoConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub processes: BTreeMap<String, ProcessConfig>,
    #[serde(default)]
    pub trees: BTreeMap<String, TreeConfig>,
    #[serde(default)]
    pub freerun: Vec<FreerunConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Historical floor for the first tree build. When absent the trees start
    /// at the current actual timeperiod.
    pub start_timeperiod: Option<String>,
    #[serde(default = "default_housekeeping_interval")]
    pub housekeeping_interval_secs: u64,
    #[serde(default = "default_max_failures")]
    pub max_number_of_failures: u32,
    #[serde(default = "default_life_support_hours")]
    pub life_support_hours: i64,
    /// Grace period after a window closes before discrete pipelines touch it.
    #[serde(default = "default_lag_minutes")]
    pub lag_minutes: i64,
    #[serde(default = "default_persistence_retries")]
    pub persistence_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            start_timeperiod: None,
            housekeeping_interval_secs: HOUSEKEEPING_INTERVAL_SECS,
            max_number_of_failures: MAX_NUMBER_OF_FAILURES,
            life_support_hours: LIFE_SUPPORT_HOURS,
            lag_minutes: LAG_MINUTES,
            persistence_retries: PERSISTENCE_RETRIES,
            retry_delay_ms: RETRY_DELAY_MS,
        }
    }
}

/// Which state-machine variant drives a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateMachineKind {
    Discrete,
    Continuous,
    Recomputing,
    SimpleDiscrete,
    Freerun,
}

impl StateMachineKind {
    /// Whether the variant may work on the still-open current timeperiod.
    pub fn runs_on_active_timeperiod(self) -> bool {
        matches!(
            self,
            StateMachineKind::Continuous | StateMachineKind::Recomputing
        )
    }
}

impl std::fmt::Display for StateMachineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StateMachineKind::Discrete => "discrete",
            StateMachineKind::Continuous => "continuous",
            StateMachineKind::Recomputing => "recomputing",
            StateMachineKind::SimpleDiscrete => "simple_discrete",
            StateMachineKind::Freerun => "freerun",
        };
        write!(f, "{s}")
    }
}

/// How a managed process waits on its neighbours before it is handed a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingType {
    #[default]
    Normal,
    Dependencies,
    Children,
}

impl std::fmt::Display for BlockingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BlockingType::Normal => "normal",
            BlockingType::Dependencies => "dependencies",
            BlockingType::Children => "children",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub qualifier: Qualifier,
    #[serde(default = "default_time_grouping")]
    pub time_grouping: u32,
    pub state_machine: StateMachineKind,
    #[serde(default)]
    pub blocking: BlockingType,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub sink: Option<String>,
    /// Opaque arguments copied into every unit of work.
    #[serde(default)]
    pub arguments: BTreeMap<String, serde_json::Value>,
    #[serde(default = "default_trigger_interval")]
    pub trigger_interval_secs: u64,
    #[serde(default = "bool_true")]
    pub is_on: bool,
    /// Overrides the variant's default (see [`StateMachineKind::runs_on_active_timeperiod`]).
    #[serde(default)]
    pub run_on_active_timeperiod: Option<bool>,
}

impl ProcessConfig {
    pub fn grouping(&self) -> Result<TimeperiodGrouping> {
        if self.qualifier == Qualifier::RealTime {
            return Ok(TimeperiodGrouping::identity(Qualifier::RealTime));
        }
        TimeperiodGrouping::new(self.qualifier, self.time_grouping)
    }

    pub fn run_on_active_timeperiod(&self) -> bool {
        self.run_on_active_timeperiod
            .unwrap_or_else(|| self.state_machine.runs_on_active_timeperiod())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Enclosed processes, one per qualifier. Order in the file is free;
    /// the tree sorts them coarsest first.
    pub processes: Vec<String>,
    #[serde(default)]
    pub dependent_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreerunConfig {
    pub process_name: String,
    pub entry_name: String,
    #[serde(default = "default_trigger_interval")]
    pub trigger_interval_secs: u64,
    #[serde(default)]
    pub arguments: BTreeMap<String, serde_json::Value>,
    #[serde(default = "bool_true")]
    pub is_on: bool,
}

fn bool_true() -> bool {
    true
}
fn default_time_grouping() -> u32 {
    1
}
fn default_trigger_interval() -> u64 {
    DEFAULT_TRIGGER_INTERVAL_SECS
}
fn default_housekeeping_interval() -> u64 {
    HOUSEKEEPING_INTERVAL_SECS
}
fn default_max_failures() -> u32 {
    MAX_NUMBER_OF_FAILURES
}
fn default_life_support_hours() -> i64 {
    LIFE_SUPPORT_HOURS
}
fn default_lag_minutes() -> i64 {
    LAG_MINUTES
}
fn default_persistence_retries() -> u32 {
    PERSISTENCE_RETRIES
}
fn default_retry_delay_ms() -> u64 {
    RETRY_DELAY_MS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tempo/tempo.db", home)
}

impl TempoConfig {
    /// Load config from a TOML file with TEMPO_* env var overrides.
    ///
    /// Nested keys use a double underscore:
    /// `TEMPO_SCHEDULER__LAG_MINUTES=10` overrides `scheduler.lag_minutes`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("TEMPO_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let config: TempoConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TEMPO_").ignore(&["CONFIG"]).split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse an in-memory TOML document. No env overrides are applied.
    pub fn from_toml(document: &str) -> Result<Self> {
        let config: TempoConfig = Figment::new()
            .merge(Toml::string(document))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn process(&self, name: &str) -> Result<&ProcessConfig> {
        self.processes
            .get(name)
            .ok_or_else(|| CoreError::Config(format!("unknown process `{name}`")))
    }

    /// Cross-checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if let Some(start) = &self.scheduler.start_timeperiod {
            time::parse(start)?;
        }
        if self.scheduler.persistence_retries == 0 {
            return Err(CoreError::Config(
                "scheduler.persistence_retries must be at least 1".into(),
            ));
        }

        for (name, process) in &self.processes {
            process
                .grouping()
                .map_err(|e| CoreError::Config(format!("process `{name}`: {e}")))?;
            if process.trigger_interval_secs == 0 {
                return Err(CoreError::Config(format!(
                    "process `{name}`: trigger_interval_secs must be positive"
                )));
            }
        }

        let mut owned = BTreeSet::new();
        for (tree_name, tree) in &self.trees {
            if tree.processes.is_empty() || tree.processes.len() > 4 {
                return Err(CoreError::Config(format!(
                    "tree `{tree_name}` must enclose 1 to 4 processes"
                )));
            }
            let mut qualifiers = BTreeSet::new();
            for process_name in &tree.processes {
                let process = self.process(process_name)?;
                if process.qualifier == Qualifier::RealTime
                    || process.state_machine == StateMachineKind::Freerun
                {
                    return Err(CoreError::Config(format!(
                        "tree `{tree_name}`: process `{process_name}` is a freerun process"
                    )));
                }
                if !qualifiers.insert(process.qualifier.rank()) {
                    return Err(CoreError::Config(format!(
                        "tree `{tree_name}`: more than one {} process",
                        process.qualifier
                    )));
                }
                if !owned.insert(process_name.as_str()) {
                    return Err(CoreError::Config(format!(
                        "process `{process_name}` belongs to more than one tree"
                    )));
                }
            }
            for dependency in &tree.dependent_on {
                if dependency == tree_name || !self.trees.contains_key(dependency) {
                    return Err(CoreError::Config(format!(
                        "tree `{tree_name}` depends on unknown tree `{dependency}`"
                    )));
                }
            }
        }

        let mut entries = BTreeSet::new();
        for entry in &self.freerun {
            let process = self.process(&entry.process_name)?;
            if process.state_machine != StateMachineKind::Freerun {
                return Err(CoreError::Config(format!(
                    "freerun entry `{}` points at non-freerun process `{}`",
                    entry.entry_name, entry.process_name
                )));
            }
            if !entries.insert((entry.process_name.as_str(), entry.entry_name.as_str())) {
                return Err(CoreError::Config(format!(
                    "duplicate freerun entry `{}::{}`",
                    entry.process_name, entry.entry_name
                )));
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tempo/tempo.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[scheduler]
start_timeperiod = "2024010100"
lag_minutes = 10

[processes.site_hourly]
qualifier = "hourly"
state_machine = "discrete"
source = "raw_events"
sink = "site_hourly"
arguments = { batch_size = 500 }

[processes.site_daily]
qualifier = "daily"
state_machine = "recomputing"
blocking = "children"

[processes.bash_driver]
qualifier = "real_time"
state_machine = "freerun"

[trees.site]
processes = ["site_hourly", "site_daily"]

[[freerun]]
process_name = "bash_driver"
entry_name = "rotate_logs"
trigger_interval_secs = 3600
"#;

    #[test]
    fn loads_processes_trees_and_freerun_entries() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = TempoConfig::load(file.path().to_str()).unwrap();

        assert_eq!(config.scheduler.lag_minutes, 10);
        assert_eq!(config.scheduler.max_number_of_failures, 3);
        assert_eq!(config.scheduler.persistence_retries, 20);

        let hourly = config.process("site_hourly").unwrap();
        assert_eq!(hourly.qualifier, Qualifier::Hourly);
        assert_eq!(hourly.blocking, BlockingType::Normal);
        assert_eq!(hourly.arguments["batch_size"], serde_json::json!(500));
        assert!(!hourly.run_on_active_timeperiod());

        let daily = config.process("site_daily").unwrap();
        assert_eq!(daily.blocking, BlockingType::Children);
        assert!(daily.run_on_active_timeperiod());

        assert_eq!(config.trees["site"].processes.len(), 2);
        assert_eq!(config.freerun[0].trigger_interval_secs, 3600);
        assert!(config.freerun[0].is_on);
    }

    #[test]
    fn missing_file_yields_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = TempoConfig::load(path.to_str()).unwrap();
        assert!(config.processes.is_empty());
        assert_eq!(config.scheduler.retry_delay_ms, 250);
    }

    #[test]
    fn rejects_grouping_out_of_range() {
        let doc = r#"
[processes.p]
qualifier = "hourly"
time_grouping = 24
state_machine = "discrete"
"#;
        let err = TempoConfig::from_toml(doc).unwrap_err();
        assert!(err.to_string().contains("process `p`"), "{err}");
    }

    #[test]
    fn rejects_unknown_dependency_and_duplicate_qualifier() {
        let doc = r#"
[processes.a]
qualifier = "hourly"
state_machine = "discrete"

[processes.b]
qualifier = "hourly"
state_machine = "discrete"

[trees.t]
processes = ["a", "b"]
"#;
        assert!(TempoConfig::from_toml(doc).is_err());

        let doc = r#"
[processes.a]
qualifier = "hourly"
state_machine = "discrete"

[trees.t]
processes = ["a"]
dependent_on = ["nowhere"]
"#;
        assert!(TempoConfig::from_toml(doc).is_err());
    }

    #[test]
    fn freerun_entries_must_use_freerun_processes() {
        let doc = r#"
[processes.a]
qualifier = "hourly"
state_machine = "discrete"

[[freerun]]
process_name = "a"
entry_name = "x"
"#;
        assert!(TempoConfig::from_toml(doc).is_err());
    }
}
