use super::{JobRouter, RouteChoice};
use crate::{
    ad::{attr, managed, JobStatus, Universe, Value},
    job::RoutedJob,
    predicate::Predicate,
};
use once_cell::sync::Lazy;
use tracing::{debug, info};

// jobs any router may consider, independent of identity and routes
static ELIGIBLE_JOB: Lazy<Vec<Predicate>> = Lazy::new(|| {
    vec![
        Predicate::ge(attr::PROC_ID, 0),
        Predicate::eq(attr::JOB_STATUS, JobStatus::Idle),
        Predicate::eq(attr::JOB_UNIVERSE, Universe::Vanilla),
        Predicate::is_not(attr::MANAGED, managed::DONE),
        Predicate::is_not(attr::MANAGED, managed::EXTERNAL),
        Predicate::defined(attr::OWNER),
    ]
});

impl JobRouter {
    /// predicate selecting source jobs that could go to one of the routes still accepting jobs,
    /// `None` if no route accepts jobs
    pub(crate) fn candidate_constraint(&self) -> Option<Predicate> {
        let mut route_requirements = Vec::new();
        let mut any_accepting = false;
        let mut unrestricted = false;

        for route in self.routes.iter().filter(|route| route.accepting_more_jobs()) {
            any_accepting = true;

            match route.requirements() {
                Some(requirements) => {
                    let bound = requirements.bind(route.route_ad());
                    if !route_requirements.contains(&bound) {
                        route_requirements.push(bound);
                    }
                }
                None => unrestricted = true,
            }
        }

        if !any_accepting {
            return None;
        }

        let mut terms = Vec::new();
        if let Some(ref constraint) = self.constraint {
            terms.push(constraint.clone());
        }
        if !unrestricted {
            terms.push(Predicate::Any(route_requirements));
        }
        terms.extend(ELIGIBLE_JOB.iter().cloned());
        terms.push(Predicate::is_not(attr::ROUTED_BY, self.name.as_str()));

        if !self.context.privileged {
            // only our own jobs can be claimed without privileges
            terms.push(Predicate::eq(
                attr::OWNER,
                self.context
                    .owner
                    .as_deref()
                    .map(Value::from)
                    .unwrap_or_default(),
            ));
            if let Some(ref domain) = self.context.domain {
                terms.push(Predicate::eq(attr::NT_DOMAIN, domain.as_str()));
            }
        }

        Some(Predicate::All(terms))
    }

    pub(crate) fn get_candidate_jobs(&mut self) {
        if !self.accepting_more_jobs() {
            debug!("JobRouter: not considering new jobs, router is full");
            return;
        }

        let Some(constraint) = self.candidate_constraint() else {
            debug!("JobRouter: not considering new jobs, all routes are full");
            return;
        };
        debug!("JobRouter: checking for candidate jobs routing constraint: {constraint}");

        for key in self.source.query(&constraint) {
            if !self.accepting_more_jobs() {
                debug!("JobRouter: not considering more jobs, router is full");
                break;
            }
            if self.jobs.contains_key(&key) {
                continue;
            }

            let Some(ad) = self.source.get_ad(&key) else {
                continue;
            };

            match self.choose_route(&ad) {
                RouteChoice::Chosen(route_name) => {
                    let mut job = RoutedJob::new(key.clone(), ad, route_name);
                    job.grid_resource = self
                        .routes
                        .get(&job.route_name)
                        .map(|route| route.grid_resource().to_owned())
                        .unwrap_or_default();

                    info!(job = %job.describe(), "JobRouter: found candidate job");
                    self.jobs.insert(key, job);
                }
                RouteChoice::NoMatch => {
                    debug!(job = %key, "JobRouter: no route matches candidate job");
                }
                RouteChoice::AllRoutesFull => {
                    debug!("JobRouter: all routes are full");
                    break;
                }
            }
        }
    }
}
