mod candidates;
mod orphans;
mod steps;


use crate::{
    ad::{JobAd, JobKey},
    clock::Clock,
    config::RouterConfig,
    job::{JobState, RoutedJob},
    matching::MatchEngine,
    predicate::Predicate,
    queue::JobQueue,
    route::RoutingTable,
    sync::{InstanceLock, LockError},
    transform::UniverseTransform,
};
use rand::Rng;
use std::{collections::BTreeMap, path::Path, sync::Arc};
use tracing::{debug, info, instrument, warn};

/// Who the router runs as, decides which source jobs it may touch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterContext {
    // root may route everybody's jobs
    pub privileged: bool,
    pub owner: Option<String>,
    pub domain: Option<String>,
}

impl RouterContext {
    pub fn from_system() -> Self {
        let uid = nix::unistd::geteuid();
        let owner = match nix::unistd::User::from_uid(uid) {
            Ok(user) => user.map(|user| user.name),
            Err(error) => {
                warn!(error = ?error, "Failed to look up the current user: {error}");
                None
            }
        };

        Self {
            privileged: uid.is_root(),
            owner,
            domain: None,
        }
    }
}

/// External services the router drives
pub struct Collaborators {
    pub source: Arc<dyn JobQueue>,
    // may be the same queue as `source`
    pub destination: Arc<dyn JobQueue>,
    pub matcher: Box<dyn MatchEngine>,
    pub transform: Box<dyn UniverseTransform>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteChoice {
    Chosen(String),
    NoMatch,
    AllRoutesFull,
}

pub struct JobRouter {
    context: RouterContext,
    source: Arc<dyn JobQueue>,
    destination: Arc<dyn JobQueue>,
    matcher: Box<dyn MatchEngine>,
    transform: Box<dyn UniverseTransform>,
    clock: Arc<dyn Clock>,

    jobs: BTreeMap<JobKey, RoutedJob>,
    routes: RoutingTable,
    constraint: Option<Predicate>,
    name: String,
    max_jobs: i64,
    polling_period: u64,
    max_job_mirror_update_lag: i64,
    orphan_scan_interval: u64,
    release_on_hold: bool,
    entries_refresh: i64,
    // when the route entries were last read
    entries_read_at: i64,
    routing_enabled: bool,
    poll_count: u64,
    lock: Option<InstanceLock>,
}

impl JobRouter {
    pub fn new(context: RouterContext, collaborators: Collaborators) -> Self {
        let defaults = RouterConfig::default();

        Self {
            context,
            source: collaborators.source,
            destination: collaborators.destination,
            matcher: collaborators.matcher,
            transform: collaborators.transform,
            clock: collaborators.clock,
            jobs: BTreeMap::new(),
            routes: RoutingTable::new(),
            constraint: None,
            name: defaults.name,
            max_jobs: defaults.max_jobs,
            polling_period: defaults.polling_period,
            max_job_mirror_update_lag: defaults.max_job_mirror_update_lag,
            orphan_scan_interval: defaults.orphan_scan_interval,
            release_on_hold: defaults.release_on_hold,
            entries_refresh: defaults.entries_refresh as i64,
            entries_read_at: 0,
            routing_enabled: false,
            poll_count: 0,
            lock: None,
        }
    }

    /// (re)load the configuration, returns whether the polling period changed
    pub fn config(&mut self, config: &RouterConfig) -> bool {
        let now = self.clock.now();
        let mut routes = RoutingTable::build(
            config.route_entries(),
            &config.defaults,
            config.source_constraint.is_some(),
            now,
        );

        for route in routes.iter_mut() {
            match self.routes.get(route.name()) {
                Some(old) => route.copy_state(old),
                None => info!(route = %route.name(), "JobRouter: Adding route {route}"),
            }
        }
        for old in self.routes.iter() {
            if !routes.contains(old.name()) {
                info!(route = %old.name(), "JobRouter: Removing route {old}");
            }
        }

        if self.name != config.name && !self.jobs.is_empty() {
            warn!(
                "JobRouter name changed from {} to {} while managing jobs; jobs routed under the old name will not be recovered",
                self.name, config.name
            );
        }

        self.routing_enabled = !routes.is_empty() || config.source_constraint.is_some();
        if !self.routing_enabled {
            warn!("JobRouter: no routes and no source constraint, routing is disabled until reconfigured");
        }

        self.routes = routes;
        self.constraint = config.source_constraint.clone();
        self.name = config.name.clone();
        self.max_jobs = config.max_jobs;
        self.max_job_mirror_update_lag = config.max_job_mirror_update_lag;
        self.orphan_scan_interval = config.orphan_scan_interval.max(1);
        self.release_on_hold = config.release_on_hold;
        self.entries_refresh = config.entries_refresh as i64;
        self.entries_read_at = now;

        let period_changed = self.polling_period != config.polling_period;
        self.polling_period = config.polling_period;

        period_changed
    }

    /// re-read the route entries of `config` once `entries_refresh` seconds have passed,
    /// returns whether they were read
    pub fn refresh_entries(&mut self, config: &RouterConfig) -> bool {
        let due = self.clock.now() - self.entries_read_at >= self.entries_refresh;
        if self.entries_refresh <= 0 || !due {
            return false;
        }

        debug!("JobRouter: refreshing route entries");
        self.config(config);

        true
    }

    /// take the per identity lock, a second router with the same name must not start
    pub fn get_instance_lock(&mut self, directory: &Path) -> Result<(), LockError> {
        self.lock = Some(InstanceLock::acquire(&self.name, directory)?);

        Ok(())
    }

    #[instrument(skip(self), fields(router = %self.name))]
    pub fn poll(&mut self) {
        debug!("JobRouter: polling state of ({}) managed jobs", self.managed_job_count());

        self.poll_count += 1;
        if (self.poll_count - 1) % self.orphan_scan_interval == 0 {
            self.adopt_orphans();
        }

        self.update_route_stats();
        if self.routing_enabled {
            self.get_candidate_jobs();
        }

        let keys = self.jobs.keys().cloned().collect::<Vec<_>>();
        for key in keys {
            // the job leaves the table while its steps run, so steps may borrow the router freely
            let Some(mut job) = self.jobs.remove(&key) else {
                continue;
            };

            if self.advance(&mut job) {
                self.jobs.insert(key, job);
            }
        }

        for route in self.routes.iter() {
            debug!(route = %route.name(), "JobRouter: {}", route.status_line());
        }
    }

    /// run the pipeline on one job, returns false once the job can be forgotten
    fn advance(&mut self, job: &mut RoutedJob) -> bool {
        // at most one forward protocol step per poll, the escape to cleanup is handled right away
        match job.state {
            JobState::Unclaimed => self.take_over_job(job),
            JobState::Claimed => self.submit_job(job),
            JobState::Submitted => self.check_submitted_job_status(job),
            JobState::Finished => self.finalize_job(job),
            JobState::Cleanup | JobState::Retired => {}
        }
        self.cleanup_job(job);

        self.cleanup_retired_job(job)
    }

    /// best effort release of claims for jobs that never made it to the destination queue
    pub fn shutdown(&mut self) {
        info!("JobRouter: shutting down, yielding unsubmitted jobs");

        for job in self.jobs.values() {
            if !job.is_claimed || (job.dest_key.is_some() && !job.dest_removed) {
                continue;
            }

            match self.source.yield_job(
                &job.src_ad,
                false,
                &job.src_key,
                &self.name,
                self.release_on_hold,
            ) {
                Ok(()) => debug!(job = %job.describe(), "JobRouter: yielded job on shutdown"),
                Err(error) => {
                    warn!(error = ?error, job = %job.describe(), "JobRouter: failed to yield job on shutdown: {error}")
                }
            }
        }

        self.jobs.clear();
        self.lock = None;
    }

    pub fn accepting_more_jobs(&self) -> bool {
        self.max_jobs < 0 || (self.managed_job_count() as i64) < self.max_jobs
    }

    pub fn managed_job_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|job| job.state != JobState::Retired)
            .count()
    }

    /// pick a random matching route that accepts more jobs and count the job against it
    pub fn choose_route(&mut self, job_ad: &JobAd) -> RouteChoice {
        let mut any_accepting = false;
        let mut matches = Vec::new();

        for route in self.routes.iter() {
            if !route.accepting_more_jobs() {
                continue;
            }
            any_accepting = true;

            let matched = match route.requirements() {
                Some(requirements) => self.matcher.matches(requirements, route.route_ad(), job_ad),
                None => true,
            };
            if matched {
                matches.push(route.name().to_owned());
            }
        }

        if !any_accepting {
            return RouteChoice::AllRoutesFull;
        }
        if matches.is_empty() {
            return RouteChoice::NoMatch;
        }

        let chosen = matches.swap_remove(rand::thread_rng().gen_range(0..matches.len()));
        if let Some(route) = self.routes.get_mut(&chosen) {
            route.increment_routed_jobs();
        }

        RouteChoice::Chosen(chosen)
    }

    /// re-derive per route counters from the job table and adjust throttles
    pub fn update_route_stats(&mut self) {
        let now = self.clock.now();

        for route in self.routes.iter_mut() {
            route.reset_current_routed_jobs();
        }
        for job in self.jobs.values() {
            if job.state == JobState::Retired || !job.has_route() {
                continue;
            }
            if let Some(route) = self.routes.get_mut(&job.route_name) {
                route.increment_current_routed_jobs(job.is_running);
            }
        }
        for route in self.routes.iter_mut() {
            route.adjust_failure_throttles(now);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn polling_period(&self) -> u64 {
        self.polling_period
    }

    pub fn jobs(&self) -> &BTreeMap<JobKey, RoutedJob> {
        &self.jobs
    }

    pub fn job(&self, key: &JobKey) -> Option<&RoutedJob> {
        self.jobs.get(key)
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn is_routing_enabled(&self) -> bool {
        self.routing_enabled
    }
}
