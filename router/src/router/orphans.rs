use super::JobRouter;
use crate::{
    ad::{attr, managed, JobKey},
    job::{JobState, RoutedJob},
    predicate::Predicate,
};
use tracing::{debug, error, info};

impl JobRouter {
    /// Recover jobs routed or claimed by an earlier run under the same name
    ///
    /// Routed jobs whose source still exists are tracked again, the rest are
    /// removed. Source jobs still claimed by us without any routed job are
    /// yielded back. Retired jobs stay in the table until the mirror catches
    /// up, which keeps them from showing up here.
    pub fn adopt_orphans(&mut self) {
        let routed_by_us = Predicate::All(vec![
            Predicate::ge(attr::PROC_ID, 0),
            Predicate::eq(attr::ROUTED_BY, self.name.as_str()),
            // guards against an inconsistent snapshot of the queue
            Predicate::defined(attr::OWNER),
        ]);

        for dest_key in self.destination.query(&routed_by_us) {
            let Some(dest_ad) = self.destination.get_ad(&dest_key) else {
                continue;
            };

            let (Some(src_key), Some(route_name)) = (
                dest_ad.get_str(attr::ROUTED_FROM_JOB_ID),
                dest_ad.get_str(attr::ROUTE_NAME),
            ) else {
                error!(dest = %dest_key, "JobRouter failure: no routing information found in routed job");
                continue;
            };
            let src_key = JobKey::new(src_key);
            let route_name = route_name.to_owned();

            let tracked = self.jobs.get(&src_key);
            if tracked.map_or(false, |job| job.dest_key.as_ref() == Some(&dest_key)) {
                continue;
            }

            let src_ad = match self.source.get_ad(&src_key) {
                Some(src_ad) if tracked.is_none() => src_ad,
                src_ad => {
                    if src_ad.is_none() {
                        info!(src = %src_key, dest = %dest_key, "JobRouter: removing orphaned destination job with no matching source job");
                    } else {
                        info!(src = %src_key, dest = %dest_key, "JobRouter: removing orphaned destination job of a source job routed elsewhere");
                    }
                    if let Err(error) = self.destination.remove_job(&dest_ad, &dest_key, "JobRouter orphan") {
                        error!(error = ?error, src = %src_key, dest = %dest_key, "JobRouter: failed to remove dest job: {error}");
                    }
                    continue;
                }
            };

            let mut job = RoutedJob::new(src_key.clone(), src_ad, route_name);
            job.state = JobState::Submitted;
            job.is_claimed = true;
            // not the real submission time, but it bounds the wait for the mirror
            job.submission_time = self.clock.now();
            job.grid_resource = dest_ad
                .get_str(attr::GRID_RESOURCE)
                .unwrap_or_default()
                .to_owned();
            job.dest_key = Some(dest_key);
            job.dest_ad = dest_ad;

            debug!(job = %job.describe(), "JobRouter: adopted orphaned job (from previous run?)");
            self.jobs.insert(src_key, job);
        }

        let managed_by_us = Predicate::All(vec![
            Predicate::eq(attr::MANAGED, managed::EXTERNAL),
            Predicate::eq(attr::MANAGED_MANAGER, self.name.as_str()),
            Predicate::defined(attr::OWNER),
        ]);

        for src_key in self.source.query(&managed_by_us) {
            if self.jobs.contains_key(&src_key) {
                continue;
            }
            let Some(src_ad) = self.source.get_ad(&src_key) else {
                continue;
            };

            info!(src = %src_key, "JobRouter: found orphan with no routed destination job; yielding management of it");

            match self.source.yield_job(
                &src_ad,
                false,
                &src_key,
                &self.name,
                self.release_on_hold,
            ) {
                Ok(()) => debug!(src = %src_key, "JobRouter: yielded orphan job"),
                Err(error) => {
                    error!(error = ?error, src = %src_key, "JobRouter: failed to yield orphan job: {error}")
                }
            }
        }
    }
}
