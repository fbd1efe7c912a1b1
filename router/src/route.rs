use crate::{
    ad::{JobAd, Value},
    config::RouteConfig,
    predicate::Predicate,
};
use itertools::Itertools;
use std::{
    collections::{btree_map, BTreeMap},
    fmt::{self, Display},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// seconds between two throttle adjustments
pub const THROTTLE_UPDATE_INTERVAL: i64 = 600;

const COPY_PREFIX: &str = "copy_";
const DELETE_PREFIX: &str = "delete_";
const SET_PREFIX: &str = "set_";

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("Route entry is malformed: {0}")]
    Malformed(#[from] serde_yaml::Error),
    #[error("Missing or invalid grid_resource in job route")]
    MissingGridResource,
    #[error("Missing requirements in job route")]
    MissingRequirements,
    #[error("Empty attribute name in {0} directive")]
    EmptyAttributeName(&'static str),
}

/// A routing rule, immutable apart from its counters until the next reload
#[derive(Debug, Clone)]
pub struct JobRoute {
    name: String,
    grid_resource: String,
    requirements: Option<Predicate>,
    max_jobs: i64,
    max_idle_jobs: i64,
    failure_rate_threshold: f64,
    job_failure_test: Option<Predicate>,
    periodic_hold: Option<Predicate>,
    periodic_remove: Option<Predicate>,
    override_routing_entry: Option<bool>,
    // attributes and edit directives as a single ad, see `apply_routing_job_edits`
    route_ad: JobAd,

    // re-derived from the job table on every poll
    current_routed_jobs: i64,
    current_running_jobs: i64,

    // state that survives a reload
    recent_stats_begin: i64,
    recent_jobs_routed: i64,
    recent_jobs_succeeded: i64,
    recent_jobs_failed: i64,
    throttle: f64,
}

impl JobRoute {
    pub fn from_config(
        config: &RouteConfig,
        allow_empty_requirements: bool,
        now: i64,
    ) -> Result<Self, RouteError> {
        let grid_resource = config
            .grid_resource
            .clone()
            .filter(|resource| !resource.trim().is_empty())
            .ok_or(RouteError::MissingGridResource)?;
        // unnamed routes are named after their grid resource
        let name = config.name.clone().unwrap_or_else(|| grid_resource.clone());

        if config.requirements.is_none() && !allow_empty_requirements {
            return Err(RouteError::MissingRequirements);
        }

        if config.copy.iter().any(|(from, to)| from.is_empty() || to.is_empty()) {
            return Err(RouteError::EmptyAttributeName("copy"));
        }
        if config.delete.iter().any(String::is_empty) {
            return Err(RouteError::EmptyAttributeName("delete"));
        }
        if config.set.keys().any(String::is_empty) {
            return Err(RouteError::EmptyAttributeName("set"));
        }

        let max_jobs = config.max_jobs.unwrap_or(100);
        let max_idle_jobs = config.max_idle_jobs.unwrap_or(50);
        let failure_rate_threshold = config.failure_rate_threshold.unwrap_or(0.03);

        let mut route_ad: JobAd = config
            .attributes
            .iter()
            .map(|(attr, value)| (attr.clone(), value.clone()))
            .collect();
        route_ad.insert("Name", name.as_str());
        route_ad.insert("GridResource", grid_resource.as_str());
        route_ad.insert("MaxJobs", max_jobs);
        route_ad.insert("MaxIdleJobs", max_idle_jobs);
        route_ad.insert("FailureRateThreshold", failure_rate_threshold);
        for (from, to) in config.copy.iter() {
            route_ad.insert(format!("{COPY_PREFIX}{from}"), to.as_str());
        }
        for attr in config.delete.iter() {
            route_ad.insert(format!("{DELETE_PREFIX}{attr}"), true);
        }
        for (attr, value) in config.set.iter() {
            route_ad.insert(format!("{SET_PREFIX}{attr}"), value.clone());
        }
        route_ad.clear_dirty();

        Ok(Self {
            name,
            grid_resource,
            requirements: config.requirements.clone(),
            max_jobs,
            max_idle_jobs,
            failure_rate_threshold,
            job_failure_test: config.job_failure_test.clone(),
            periodic_hold: config.periodic_hold.clone(),
            periodic_remove: config.periodic_remove.clone(),
            override_routing_entry: config.override_routing_entry,
            route_ad,
            current_routed_jobs: 0,
            current_running_jobs: 0,
            recent_stats_begin: now,
            recent_jobs_routed: 0,
            recent_jobs_succeeded: 0,
            recent_jobs_failed: 0,
            throttle: 0.0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn grid_resource(&self) -> &str {
        &self.grid_resource
    }

    pub fn requirements(&self) -> Option<&Predicate> {
        self.requirements.as_ref()
    }

    pub fn job_failure_test(&self) -> Option<&Predicate> {
        self.job_failure_test.as_ref()
    }

    pub fn periodic_hold(&self) -> Option<&Predicate> {
        self.periodic_hold.as_ref()
    }

    pub fn periodic_remove(&self) -> Option<&Predicate> {
        self.periodic_remove.as_ref()
    }

    pub fn route_ad(&self) -> &JobAd {
        &self.route_ad
    }

    pub fn max_jobs(&self) -> i64 {
        self.max_jobs
    }

    pub fn max_idle_jobs(&self) -> i64 {
        self.max_idle_jobs
    }

    pub fn current_routed_jobs(&self) -> i64 {
        self.current_routed_jobs
    }

    pub fn current_running_jobs(&self) -> i64 {
        self.current_running_jobs
    }

    pub fn current_idle_jobs(&self) -> i64 {
        self.current_routed_jobs - self.current_running_jobs
    }

    pub fn throttle(&self) -> f64 {
        self.throttle
    }

    pub fn recent_jobs_routed(&self) -> i64 {
        self.recent_jobs_routed
    }

    pub fn recent_jobs_succeeded(&self) -> i64 {
        self.recent_jobs_succeeded
    }

    pub fn recent_jobs_failed(&self) -> i64 {
        self.recent_jobs_failed
    }

    pub fn accepting_more_jobs(&self) -> bool {
        if self.throttle > 0.0 && self.throttle <= self.recent_jobs_routed as f64 {
            return false;
        }
        if self.max_idle_jobs >= 0 && self.max_idle_jobs <= self.current_idle_jobs() {
            return false;
        }

        self.max_jobs < 0 || self.current_routed_jobs < self.max_jobs
    }

    pub fn reset_current_routed_jobs(&mut self) {
        self.current_routed_jobs = 0;
        self.current_running_jobs = 0;
    }

    pub fn increment_current_routed_jobs(&mut self, running: bool) {
        self.current_routed_jobs += 1;
        if running {
            self.current_running_jobs += 1;
        }
    }

    /// account for a job that was just routed here, ahead of the next stats refresh
    pub fn increment_routed_jobs(&mut self) {
        self.current_routed_jobs += 1;
        self.recent_jobs_routed += 1;
    }

    pub fn increment_successes(&mut self) {
        self.recent_jobs_succeeded += 1;
    }

    pub fn increment_failures(&mut self) {
        self.recent_jobs_failed += 1;
    }

    /// carry over state that cannot be re-derived from the job table
    pub fn copy_state(&mut self, old: &JobRoute) {
        self.recent_stats_begin = old.recent_stats_begin;
        self.recent_jobs_routed = old.recent_jobs_routed;
        self.recent_jobs_succeeded = old.recent_jobs_succeeded;
        self.recent_jobs_failed = old.recent_jobs_failed;
        self.throttle = old.throttle;
    }

    pub fn adjust_failure_throttles(&mut self, now: i64) {
        let delta = now - self.recent_stats_begin;

        if delta < THROTTLE_UPDATE_INTERVAL {
            return;
        }

        let delta = delta as f64;
        let failed = self.recent_jobs_failed as f64;
        let succeeded = self.recent_jobs_succeeded as f64;
        let recent_failure_rate = failed / delta;
        let mut new_throttle = self.throttle;

        debug!(
            route = %self.name,
            "Checking throttle: recent failure rate {recent_failure_rate} vs. threshold {}; recent successes {} and failures {}",
            self.failure_rate_threshold, self.recent_jobs_succeeded, self.recent_jobs_failed
        );

        if recent_failure_rate > self.failure_rate_threshold && self.recent_jobs_failed > 0 {
            // decelerate and aim for the configured failure rate
            let recent_non_failures = (self.current_routed_jobs + self.recent_jobs_succeeded) as f64;
            let failure_ratio = failed / (failed + recent_non_failures);

            new_throttle =
                THROTTLE_UPDATE_INTERVAL as f64 * self.failure_rate_threshold / failure_ratio;
        } else {
            // all succeeding: x5, half and half: x2.5, nothing happened: x2, all failing: x1
            let mut accel = 3.0 * succeeded - 2.0 * failed;
            if accel > 0.0 {
                accel /= succeeded + failed;
            }
            accel += 2.0;

            if accel > 1.0 {
                new_throttle *= accel;
            }

            if new_throttle > THROTTLE_UPDATE_INTERVAL as f64 * self.failure_rate_threshold * 10000.0
            {
                new_throttle = 0.0;
            }
            // let at least one job through or we may never get anywhere
            if new_throttle > 0.0 && new_throttle < 1.0 && self.recent_jobs_failed == 0 {
                new_throttle = 1.0;
            }
        }

        if (new_throttle - self.throttle).abs() > 0.0001 {
            info!(
                route = %self.name,
                "Adjusting throttle from {} to {}",
                throttle_desc(self.throttle),
                throttle_desc(new_throttle)
            );
            self.throttle = new_throttle;
        }

        self.recent_stats_begin = now;
        self.recent_jobs_routed = 0;
        self.recent_jobs_succeeded = 0;
        self.recent_jobs_failed = 0;
    }

    /// Apply the route's edit directives to `ad`
    ///
    /// All `copy_` directives run before all `delete_` directives, which run
    /// before all `set_` directives, so a set may overwrite a freshly copied
    /// attribute. Within a pass directives run in attribute name order.
    pub fn apply_routing_job_edits(&self, ad: &mut JobAd) {
        ad.pause_tracking();

        for (attr, new_attr) in self.directives(COPY_PREFIX) {
            let Some(new_attr) = new_attr.as_str() else {
                error!(route = %self.name, "copy_{attr} does not name an attribute");
                continue;
            };
            debug!(route = %self.name, "Copying attribute {attr} to {new_attr}");

            let value = ad.lookup(attr);
            ad.insert(new_attr, value);
        }

        for (attr, _) in self.directives(DELETE_PREFIX) {
            debug!(route = %self.name, "Deleting attribute {attr}");
            ad.remove(attr);
        }

        for (attr, value) in self.directives(SET_PREFIX) {
            debug!(route = %self.name, "Setting attribute {attr}");
            ad.insert(attr, value.clone());
        }

        ad.resume_tracking();
    }

    fn directives<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a Value)> {
        self.route_ad
            .iter()
            .filter_map(move |(attr, value)| attr.strip_prefix(prefix).map(|attr| (attr, value)))
    }

    /// one line summary of the route counters
    pub fn status_line(&self) -> String {
        format!(
            "{} submitted (max {}), {} idle (max {}), throttle: {}, recent stats: {} started, {} succeeded, {} failed",
            self.current_routed_jobs,
            self.max_jobs,
            self.current_idle_jobs(),
            self.max_idle_jobs,
            throttle_desc(self.throttle),
            self.recent_jobs_routed,
            self.recent_jobs_succeeded,
            self.recent_jobs_failed
        )
    }
}

pub fn throttle_desc(throttle: f64) -> String {
    if throttle <= 0.0 {
        "none".to_owned()
    } else {
        format!("{} jobs/sec", throttle / THROTTLE_UPDATE_INTERVAL as f64)
    }
}

impl Display for JobRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[ {} ]",
            self.route_ad
                .iter()
                .map(|(attr, value)| format!("{attr} = {value}"))
                .join("; ")
        )?;

        if let Some(ref requirements) = self.requirements {
            write!(f, " requirements: {requirements}")?;
        }

        Ok(())
    }
}

/// Routes by name
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: BTreeMap<String, JobRoute>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// parse route entries one by one, malformed or conflicting entries are logged and skipped
    pub fn build(
        entries: Vec<(String, serde_yaml::Value)>,
        defaults: &RouteConfig,
        allow_empty_requirements: bool,
        now: i64,
    ) -> Self {
        let mut table = Self::new();

        for (source, entry) in entries {
            let route = serde_yaml::from_value::<RouteConfig>(entry)
                .map_err(RouteError::from)
                .and_then(|config| {
                    JobRoute::from_config(
                        &config.merged_over(defaults),
                        allow_empty_requirements,
                        now,
                    )
                });

            let route = match route {
                Ok(route) => route,
                Err(error) => {
                    error!(error = ?error, "CONFIGURATION ERROR: Ignoring route entry in {source}: {error}");
                    continue;
                }
            };

            if table.routes.contains_key(route.name()) {
                match route.override_routing_entry {
                    Some(true) => {
                        info!(route = %route.name(), "Route entry in {source} overrides an earlier entry with the same name");
                    }
                    Some(false) => {
                        debug!(route = %route.name(), "Ignoring duplicate route entry in {source}");
                        continue;
                    }
                    None => {
                        warn!(
                            route = %route.name(),
                            "CONFIGURATION WARNING: two route entries in {source} have the same name, ignoring the second one; give them distinct names or set override_routing_entry"
                        );
                        continue;
                    }
                }
            }

            table.insert(route);
        }

        table
    }

    pub fn insert(&mut self, route: JobRoute) {
        self.routes.insert(route.name.clone(), route);
    }

    pub fn get(&self, name: &str) -> Option<&JobRoute> {
        self.routes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut JobRoute> {
        self.routes.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    pub fn iter(&self) -> btree_map::Values<'_, String, JobRoute> {
        self.routes.values()
    }

    pub fn iter_mut(&mut self) -> btree_map::ValuesMut<'_, String, JobRoute> {
        self.routes.values_mut()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::attr;

    fn entry(yaml: &str) -> (String, serde_yaml::Value) {
        ("entries".to_owned(), serde_yaml::from_str(yaml).unwrap())
    }

    fn route(yaml: &str) -> JobRoute {
        let config: RouteConfig = serde_yaml::from_str(yaml).unwrap();

        JobRoute::from_config(&config, true, 0).unwrap()
    }

    #[test]
    fn name_defaults_to_grid_resource() {
        let route = route("grid_resource: batch pbs");

        assert_eq!(route.name(), "batch pbs");
        assert_eq!(route.max_jobs(), 100);
        assert_eq!(route.max_idle_jobs(), 50);
    }

    #[test]
    fn requirements_are_mandatory_without_global_constraint() {
        let config: RouteConfig = serde_yaml::from_str("grid_resource: batch pbs").unwrap();

        assert!(matches!(
            JobRoute::from_config(&config, false, 0),
            Err(RouteError::MissingRequirements)
        ));
    }

    #[test]
    fn malformed_and_duplicate_entries_are_skipped() {
        let table = RoutingTable::build(
            vec![
                entry("{name: a, grid_resource: x, requirements: {const: true}}"),
                entry("{name: b, requirements: {const: true}}"),
                entry("{name: c, grid_resource: x, requirements: {const: true}, bogus: 1}"),
                entry("{name: a, grid_resource: y, requirements: {const: true}}"),
                entry("{name: d, grid_resource: z}"),
            ],
            &RouteConfig::default(),
            false,
            0,
        );

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("a").unwrap().grid_resource(), "x");
    }

    #[test]
    fn explicit_override_replaces_earlier_entry() {
        let table = RoutingTable::build(
            vec![
                entry("{name: a, grid_resource: x}"),
                entry("{name: a, grid_resource: y, override_routing_entry: true}"),
            ],
            &RouteConfig::default(),
            true,
            0,
        );

        assert_eq!(table.get("a").unwrap().grid_resource(), "y");
    }

    #[test]
    fn copy_runs_before_delete_and_set() {
        let route = route(
            "grid_resource: x\ncopy: {Requirements: OriginalRequirements, Cmd: OriginalCmd}\ndelete: [Cmd]\nset: {OriginalCmd: overridden, Rank: 7}",
        );
        let mut ad: JobAd = [
            ("Requirements", Value::from("Arch == \"X86_64\"")),
            ("Cmd", Value::from("/bin/sleep")),
        ]
        .into_iter()
        .collect();

        route.apply_routing_job_edits(&mut ad);

        assert_eq!(ad.get_str("OriginalRequirements"), Some("Arch == \"X86_64\""));
        assert_eq!(ad.get_str("OriginalCmd"), Some("overridden"));
        assert_eq!(ad.get_int("Rank"), Some(7));
        assert!(!ad.contains("Cmd"));
        // edits are not reported as changes of the source job
        assert!(!ad.is_dirty());
    }

    #[test]
    fn copy_of_missing_attribute_is_undefined() {
        let route = route("grid_resource: x\ncopy: {Missing: Copied}");
        let mut ad = JobAd::new();

        route.apply_routing_job_edits(&mut ad);

        assert_eq!(ad.get("Copied"), Some(&Value::Undefined));
    }

    #[test]
    fn edits_are_deterministic() {
        let route = route(
            "grid_resource: x\ncopy: {Owner: OrigOwner, JobStatus: OrigStatus}\nset: {JobStatus: 1, Queue: short}",
        );
        let source: JobAd = [
            (attr::OWNER, Value::from("alice")),
            (attr::JOB_STATUS, Value::from(2)),
        ]
        .into_iter()
        .collect();

        let mut first = source.clone();
        let mut second = source.clone();
        route.apply_routing_job_edits(&mut first);
        route.apply_routing_job_edits(&mut second);

        assert_eq!(first, second);
        assert_eq!(first.get_int("OrigStatus"), Some(2));
        assert_eq!(first.get_int(attr::JOB_STATUS), Some(1));

        // re-applying to an already edited ad changes nothing either
        let mut third = first.clone();
        route.apply_routing_job_edits(&mut third);
        assert_eq!(third.get_int("OrigStatus"), Some(1));
    }

    #[test]
    fn max_jobs_and_idle_caps_stop_admission() {
        let mut route = route("{grid_resource: x, max_jobs: 2, max_idle_jobs: -1}");

        assert!(route.accepting_more_jobs());
        route.increment_routed_jobs();
        route.increment_routed_jobs();
        assert!(!route.accepting_more_jobs());

        let mut unlimited = self::route("{grid_resource: x, max_jobs: -1, max_idle_jobs: 1}");
        unlimited.increment_current_routed_jobs(true);
        assert!(unlimited.accepting_more_jobs());
        unlimited.increment_current_routed_jobs(false);
        assert!(!unlimited.accepting_more_jobs());
    }

    #[test]
    fn failures_throttle_the_route() {
        let mut route = route("{grid_resource: x, max_jobs: -1, max_idle_jobs: -1}");

        for _ in 0..30 {
            route.increment_failures();
        }
        // too early for an adjustment
        route.adjust_failure_throttles(THROTTLE_UPDATE_INTERVAL - 1);
        assert_eq!(route.throttle(), 0.0);

        route.adjust_failure_throttles(THROTTLE_UPDATE_INTERVAL);
        assert!((route.throttle() - 18.0).abs() < 1e-9);

        for _ in 0..18 {
            assert!(route.accepting_more_jobs());
            route.increment_routed_jobs();
        }
        assert!(!route.accepting_more_jobs());
    }

    #[test]
    fn throttle_survives_reload() {
        let mut old = route("grid_resource: x");
        for _ in 0..30 {
            old.increment_failures();
        }
        old.adjust_failure_throttles(THROTTLE_UPDATE_INTERVAL);

        let mut new = route("grid_resource: x");
        new.copy_state(&old);

        assert_eq!(new.throttle(), old.throttle());
    }
}
