use crate::{ad::Value, predicate::Predicate};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env, fs,
    io::Error,
    path::PathBuf,
    process::{Command, Stdio},
};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Config file could not be read")]
    FileNotReadable(#[from] Error),
    #[error("Config file is not valid YAML")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("Config contains errors, see log")]
    PreflightFailed,
    #[error("Route entries command failed: {0}")]
    CommandFailed(String),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    // identity used to claim source jobs and tag routed jobs, changing it orphans
    // every job routed under the old name
    #[serde(default = "default_router_name")]
    pub name: String,
    // router-wide source job constraint, makes route requirements optional
    #[serde(default)]
    pub source_constraint: Option<Predicate>,
    // maximum number of non-retired jobs, -1 for unlimited
    #[serde(default = "default_max_jobs")]
    pub max_jobs: i64,
    // seconds between two polls
    #[serde(default = "default_polling_period")]
    pub polling_period: u64,
    // seconds the job queue mirror may lag behind the queue
    #[serde(default = "default_mirror_lag")]
    pub max_job_mirror_update_lag: i64,
    // run orphan recovery every n-th poll
    #[serde(default = "default_orphan_scan_interval")]
    pub orphan_scan_interval: u64,
    // release source jobs whose hold was only mirrored from the routed job
    #[serde(default = "default_release_on_hold")]
    pub release_on_hold: bool,

    // attributes applied under every route entry
    #[serde(default)]
    pub defaults: RouteConfig,
    // route entries are parsed one by one so a malformed entry can be skipped
    #[serde(default)]
    pub entries: Vec<serde_yaml::Value>,
    // YAML list of additional route entries
    #[serde(default)]
    pub entries_file: Option<PathBuf>,
    // program and arguments printing a YAML list of additional route entries
    #[serde(default)]
    pub entries_cmd: Option<Vec<String>>,
    // seconds between two re-reads of the route entries, 0 only reloads on SIGHUP
    #[serde(default)]
    pub entries_refresh: u64,

    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    #[serde(default)]
    pub queue: Option<SpoolConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SpoolConfig {
    pub source: PathBuf,
    // routed jobs land in the source spool if unset
    #[serde(default)]
    pub destination: Option<PathBuf>,
}

/// A single route entry as written in the config, all fields optional so
/// entries can be merged over `defaults`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub grid_resource: Option<String>,
    #[serde(default)]
    pub requirements: Option<Predicate>,
    #[serde(default)]
    pub max_jobs: Option<i64>,
    #[serde(default)]
    pub max_idle_jobs: Option<i64>,
    #[serde(default)]
    pub failure_rate_threshold: Option<f64>,
    #[serde(default)]
    pub job_failure_test: Option<Predicate>,
    // checked against routed source jobs on every poll, remove wins over hold
    #[serde(default)]
    pub periodic_hold: Option<Predicate>,
    #[serde(default)]
    pub periodic_remove: Option<Predicate>,
    #[serde(default)]
    pub override_routing_entry: Option<bool>,
    // plain route attributes, visible to predicates through the `my` scope
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    // copy_<old>: <new>
    #[serde(default)]
    pub copy: BTreeMap<String, String>,
    #[serde(default)]
    pub delete: Vec<String>,
    #[serde(default)]
    pub set: BTreeMap<String, Value>,
}

impl RouteConfig {
    /// layer `self` over `defaults`, fields set in `self` win
    pub fn merged_over(&self, defaults: &RouteConfig) -> RouteConfig {
        let mut attributes = defaults.attributes.clone();
        attributes.extend(self.attributes.clone());
        let mut copy = defaults.copy.clone();
        copy.extend(self.copy.clone());
        let mut set = defaults.set.clone();
        set.extend(self.set.clone());
        let mut delete = defaults.delete.clone();
        for name in self.delete.iter() {
            if !delete.contains(name) {
                delete.push(name.clone());
            }
        }

        RouteConfig {
            name: self.name.clone().or_else(|| defaults.name.clone()),
            grid_resource: self
                .grid_resource
                .clone()
                .or_else(|| defaults.grid_resource.clone()),
            requirements: self
                .requirements
                .clone()
                .or_else(|| defaults.requirements.clone()),
            max_jobs: self.max_jobs.or(defaults.max_jobs),
            max_idle_jobs: self.max_idle_jobs.or(defaults.max_idle_jobs),
            failure_rate_threshold: self
                .failure_rate_threshold
                .or(defaults.failure_rate_threshold),
            job_failure_test: self
                .job_failure_test
                .clone()
                .or_else(|| defaults.job_failure_test.clone()),
            periodic_hold: self
                .periodic_hold
                .clone()
                .or_else(|| defaults.periodic_hold.clone()),
            periodic_remove: self
                .periodic_remove
                .clone()
                .or_else(|| defaults.periodic_remove.clone()),
            override_routing_entry: self.override_routing_entry,
            attributes,
            copy,
            delete,
            set,
        }
    }
}

impl RouterConfig {
    pub fn load(path: &PathBuf) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path)?;

        Ok(serde_yaml::from_str(&content)?)
    }

    /// collect raw route entries from the config and, if set, the entries file
    /// every entry is labeled with where it came from for logging
    pub fn route_entries(&self) -> Vec<(String, serde_yaml::Value)> {
        let mut entries = self
            .entries
            .iter()
            .cloned()
            .map(|entry| ("entries".to_owned(), entry))
            .collect::<Vec<_>>();

        if let Some(ref path) = self.entries_file {
            let label = format!("entries_file ({})", path.to_string_lossy());

            match fs::read_to_string(path)
                .map_err(ConfigErrors::from)
                .and_then(|content| Ok(serde_yaml::from_str::<Vec<serde_yaml::Value>>(&content)?))
            {
                Ok(file_entries) => {
                    entries.extend(file_entries.into_iter().map(|entry| (label.clone(), entry)))
                }
                Err(error) => {
                    error!(error = ?error, "Failed to read route entries from {label}: {error}");
                }
            }
        }

        if let Some(ref command) = self.entries_cmd {
            let label = format!("entries_cmd ({})", command.join(" "));

            match run_entries_cmd(command) {
                Ok(cmd_entries) => {
                    entries.extend(cmd_entries.into_iter().map(|entry| (label.clone(), entry)))
                }
                Err(error) => {
                    error!(error = ?error, "Failed to read route entries from {label}: {error}");
                }
            }
        }

        entries
    }

    pub fn routing_entries_defined(&self) -> bool {
        !self.entries.is_empty() || self.entries_file.is_some() || self.entries_cmd.is_some()
    }

    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.name.trim().is_empty() {
            error!("name must not be empty, orphaned jobs could not be told apart from foreign ones");
            contains_error = true;
        }

        if self.polling_period == 0 {
            error!("polling_period cannot be 0");
            contains_error = true;
        }

        if self.orphan_scan_interval == 0 {
            warn!("orphan_scan_interval of 0 is treated as 1, orphans are searched on every poll");
            self.orphan_scan_interval = 1;
        }

        if self.max_job_mirror_update_lag < 0 {
            error!("max_job_mirror_update_lag must not be negative");
            contains_error = true;
        }

        if !self.routing_entries_defined() {
            warn!("Neither entries, entries_file nor entries_cmd are defined, so job routing will not take place");
        }

        if self
            .entries_cmd
            .as_ref()
            .map_or(false, |command| command.first().map_or(true, |program| program.trim().is_empty()))
        {
            error!("entries_cmd must name a program");
            contains_error = true;
        }

        if let Some(ref path) = self.entries_file {
            if !path.is_file() {
                error!(
                    "entries_file {} is either not a file or not found",
                    path.to_string_lossy()
                );
                contains_error = true;
            }
        }

        contains_error
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: default_router_name(),
            source_constraint: None,
            max_jobs: default_max_jobs(),
            polling_period: default_polling_period(),
            max_job_mirror_update_lag: default_mirror_lag(),
            orphan_scan_interval: default_orphan_scan_interval(),
            release_on_hold: default_release_on_hold(),
            defaults: RouteConfig::default(),
            entries: Vec::new(),
            entries_file: None,
            entries_cmd: None,
            entries_refresh: 0,
            lock_dir: default_lock_dir(),
            queue: None,
        }
    }
}

/// run `command` and parse its standard output as a YAML list of route entries
fn run_entries_cmd(command: &[String]) -> Result<Vec<serde_yaml::Value>, ConfigErrors> {
    let Some((program, args)) = command.split_first() else {
        return Err(ConfigErrors::CommandFailed("no program given".to_owned()));
    };

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .output()?;
    if !output.status.success() {
        return Err(ConfigErrors::CommandFailed(format!(
            "{program} exited with {}",
            output.status
        )));
    }

    Ok(serde_yaml::from_slice(&output.stdout)?)
}

fn default_router_name() -> String {
    "jobrouter".to_owned()
}

fn default_max_jobs() -> i64 {
    -1
}

fn default_polling_period() -> u64 {
    10
}

fn default_mirror_lag() -> i64 {
    600
}

fn default_orphan_scan_interval() -> u64 {
    5
}

fn default_release_on_hold() -> bool {
    true
}

// $TMPDIR, falling back to /tmp
fn default_lock_dir() -> PathBuf {
    env::var("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or(PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_an_empty_config() {
        let config: RouterConfig = serde_yaml::from_str("{}").unwrap();

        assert_eq!(config.name, "jobrouter");
        assert_eq!(config.max_jobs, -1);
        assert_eq!(config.polling_period, 10);
        assert_eq!(config.max_job_mirror_update_lag, 600);
        assert_eq!(config.orphan_scan_interval, 5);
        assert!(config.release_on_hold);
        assert!(!config.routing_entries_defined());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_yaml::from_str::<RouterConfig>("polling_perod: 3").is_err());
    }

    #[test]
    fn entry_fields_win_over_defaults() {
        let defaults = RouteConfig {
            max_jobs: Some(10),
            grid_resource: Some("batch slurm".to_owned()),
            set: [("A".to_owned(), Value::from(1)), ("B".to_owned(), Value::from(1))]
                .into_iter()
                .collect(),
            ..RouteConfig::default()
        };
        let entry = RouteConfig {
            max_jobs: Some(2),
            set: [("B".to_owned(), Value::from(2))].into_iter().collect(),
            ..RouteConfig::default()
        };

        let merged = entry.merged_over(&defaults);

        assert_eq!(merged.max_jobs, Some(2));
        assert_eq!(merged.grid_resource.as_deref(), Some("batch slurm"));
        assert_eq!(merged.set.get("A"), Some(&Value::Int(1)));
        assert_eq!(merged.set.get("B"), Some(&Value::Int(2)));
    }

    #[test]
    fn preflight_flags_an_empty_name() {
        let mut config = RouterConfig {
            name: " ".to_owned(),
            orphan_scan_interval: 0,
            ..RouterConfig::default()
        };

        assert!(config.preflight_checks());
        assert_eq!(config.orphan_scan_interval, 1);
    }

    const ENTRY: &str = "- name: site-a\n  grid_resource: batch slurm\n  requirements: {eq: {attr: JobUniverse, value: 5}}\n";

    #[test]
    fn entries_cmd_output_is_appended_to_the_entries() {
        let config = RouterConfig {
            entries: vec![serde_yaml::from_str("{name: inline}").unwrap()],
            entries_cmd: Some(vec!["printf".to_owned(), "%s".to_owned(), ENTRY.to_owned()]),
            ..RouterConfig::default()
        };

        let entries = config.route_entries();

        assert!(config.routing_entries_defined());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "entries");
        assert!(entries[1].0.starts_with("entries_cmd (printf"));
        let entry: RouteConfig = serde_yaml::from_value(entries[1].1.clone()).unwrap();
        assert_eq!(entry.name.as_deref(), Some("site-a"));
        assert!(entry.requirements.is_some());
    }

    #[test]
    fn failing_entries_cmd_contributes_nothing() {
        let config = RouterConfig {
            entries_cmd: Some(vec!["false".to_owned()]),
            ..RouterConfig::default()
        };

        assert!(config.route_entries().is_empty());
        assert!(matches!(
            run_entries_cmd(&["false".to_owned()]),
            Err(ConfigErrors::CommandFailed(_))
        ));
    }

    #[test]
    fn preflight_flags_an_empty_entries_cmd() {
        let mut config = RouterConfig {
            entries_cmd: Some(Vec::new()),
            ..RouterConfig::default()
        };

        assert!(config.preflight_checks());
    }

    #[test]
    fn entries_file_is_read_again_on_every_call() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("routes.yaml");
        fs::write(&path, ENTRY).unwrap();
        let config = RouterConfig {
            entries_file: Some(path.clone()),
            entries_refresh: 60,
            ..RouterConfig::default()
        };
        assert_eq!(config.route_entries().len(), 1);

        fs::write(&path, format!("{ENTRY}{}", ENTRY.replace("site-a", "site-b"))).unwrap();

        assert_eq!(config.route_entries().len(), 2);
    }
}
