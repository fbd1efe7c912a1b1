use super::JobRouter;
use crate::{
    ad::{attr, managed, JobStatus, Value},
    job::{JobState, RoutedJob},
    predicate::Predicate,
    queue::{ClaimResult, QueueError},
};
use std::collections::BTreeMap;
use tracing::{debug, error, info};

// hold reason code of a hold put in place by job policy
const POLICY_HOLD_CODE: i64 = 3;

impl JobRouter {
    /// redirect a job to cleanup, from any state
    pub(crate) fn gracefully_remove(&self, job: &mut RoutedJob) {
        if job.state != JobState::Retired {
            job.state = JobState::Cleanup;
        }
    }

    pub(crate) fn take_over_job(&self, job: &mut RoutedJob) {
        if job.state != JobState::Unclaimed {
            return;
        }

        match self.source.claim_job(&job.src_ad, &job.src_key, &self.name) {
            ClaimResult::Ok => {
                debug!(job = %job.describe(), "JobRouter: claimed job");
                job.state = JobState::Claimed;
                job.is_claimed = true;
            }
            ClaimResult::Busy => {
                debug!(
                    job = %job.describe(),
                    "JobRouter failure: candidate job could not be claimed because it is already claimed by somebody else"
                );
                self.gracefully_remove(job);
            }
            ClaimResult::Error(details) => {
                error!(job = %job.describe(), "JobRouter failure: candidate job could not be claimed: {details}");
                self.gracefully_remove(job);
            }
        }
    }

    pub(crate) fn submit_job(&self, job: &mut RoutedJob) {
        if job.state != JobState::Claimed {
            return;
        }

        let Some(route) = self.routes.get(&job.route_name) else {
            debug!(job = %job.describe(), "JobRouter: route has been removed before job could be submitted");
            self.gracefully_remove(job);
            return;
        };

        let mut dest_ad = self.transform.to_grid(&job.src_ad, route.grid_resource());
        route.apply_routing_job_edits(&mut dest_ad);

        // provenance, used to recover after a restart
        dest_ad.insert(attr::ROUTED_FROM_JOB_ID, job.src_key.as_str());
        dest_ad.insert(attr::ROUTED_BY, self.name.as_str());
        dest_ad.insert(attr::ROUTE_NAME, route.name());
        // may be left over from an earlier routing of the source job
        dest_ad.remove(attr::ROUTED_TO_JOB_ID);

        match self.destination.submit_job(&dest_ad) {
            Ok(dest_key) => {
                job.src_ad.insert(attr::ROUTED_TO_JOB_ID, dest_key.as_str());
                job.dest_key = Some(dest_key);
                job.dest_ad = dest_ad;
                job.grid_resource = route.grid_resource().to_owned();
                job.state = JobState::Submitted;
                job.submission_time = self.clock.now();

                info!(job = %job.describe(), "JobRouter: submitted job");
            }
            Err(error) => {
                error!(error = ?error, job = %job.describe(), "JobRouter failure: failed to submit job: {error}");
                self.gracefully_remove(job);
            }
        }
    }

    pub(crate) fn check_submitted_job_status(&self, job: &mut RoutedJob) {
        if job.state != JobState::Submitted {
            return;
        }

        let Some(src_ad) = self.source.get_ad(&job.src_key) else {
            error!(job = %job.describe(), "JobRouter: failed to find src ad in job queue mirror");
            self.gracefully_remove(job);
            return;
        };

        match src_ad.status() {
            None => {
                error!(job = %job.describe(), "JobRouter failure: cannot evaluate JobStatus in src job");
                self.gracefully_remove(job);
                return;
            }
            Some(JobStatus::Removed) => {
                debug!(job = %job.describe(), "JobRouter: found src job marked for removal");
                self.gracefully_remove(job);
                return;
            }
            Some(JobStatus::Held)
                if src_ad.get_bool(attr::HOLD_COPIED_FROM_TARGET_JOB) != Some(true) =>
            {
                debug!(job = %job.describe(), "JobRouter: found src job on hold");
                self.gracefully_remove(job);
                return;
            }
            Some(_) => {}
        }

        let Some(ref dest_key) = job.dest_key else {
            error!(job = %job.describe(), "JobRouter failure: submitted job has no destination key");
            self.gracefully_remove(job);
            return;
        };

        let Some(dest_ad) = self.destination.get_ad(dest_key) else {
            let age = self.clock.now() - job.submission_time;

            if job.saw_dest_job {
                info!(job = %job.describe(), "JobRouter: dest job was removed");
                self.gracefully_remove(job);
            } else if age > self.max_job_mirror_update_lag {
                error!(
                    job = %job.describe(),
                    "JobRouter failure: giving up, because submitted job is still not in job queue mirror (submitted {age} seconds ago). Perhaps it has been removed?"
                );
                self.gracefully_remove(job);
            } else {
                debug!(
                    job = %job.describe(),
                    "JobRouter: submitted job has not yet appeared in job queue mirror or was removed (submitted {age} seconds ago)"
                );
            }
            return;
        };

        job.saw_dest_job = true;
        job.dest_ad = dest_ad;

        let dest_status = job.dest_ad.status();
        if dest_status == Some(JobStatus::Removed) {
            info!(job = %job.describe(), "JobRouter: dest job was removed");
            self.gracefully_remove(job);
            return;
        }

        match self
            .transform
            .update_status(&src_ad, &job.dest_ad, &mut job.src_ad)
        {
            Err(error) => {
                error!(error = ?error, job = %job.describe(), "JobRouter failure: failed to update job status: {error}");
            }
            Ok(()) if job.src_ad.is_dirty() => {
                match self
                    .source
                    .push_attributes(&job.src_key, &job.src_ad.dirty_attributes())
                {
                    Ok(()) => {
                        job.src_ad.clear_dirty();
                        debug!(job = %job.describe(), "JobRouter: updated job status");
                    }
                    Err(error) => {
                        error!(error = ?error, job = %job.describe(), "JobRouter failure: failed to update src job: {error}");
                        self.gracefully_remove(job);
                        return;
                    }
                }
            }
            Ok(()) => {}
        }

        if self.apply_periodic_policy(job) {
            self.gracefully_remove(job);
            return;
        }

        let Some(dest_status) = dest_status else {
            error!(job = %job.describe(), "JobRouter failure: cannot evaluate JobStatus in target job");
            self.gracefully_remove(job);
            return;
        };

        job.is_running = matches!(
            dest_status,
            JobStatus::Running | JobStatus::TransferringOutput
        );

        let finished = job
            .dest_ad
            .get(attr::JOB_FINISHED_HOOK_DONE)
            .and_then(|value| value.as_int())
            .unwrap_or(0)
            != 0;
        if dest_status == JobStatus::Completed && finished {
            debug!(job = %job.describe(), "JobRouter: found target job finished");
            job.state = JobState::Finished;
        }
    }

    pub(crate) fn finalize_job(&self, job: &mut RoutedJob) {
        if job.state != JobState::Finished {
            return;
        }

        let finalized = match job.dest_key {
            Some(ref dest_key) => self.destination.finalize_job(&job.dest_ad, dest_key),
            None => Err(QueueError::Rejected(
                "finished job has no destination key".to_owned(),
            )),
        };

        match finalized {
            Ok(()) => {
                info!(job = %job.describe(), "JobRouter: finalized job");
                job.is_done = true;
                job.is_success = self.test_job_success(job);

                if !job.is_success {
                    info!(job = %job.describe(), "JobRouter: job_failure_test is true, so job will count as a failure");
                }
            }
            Err(error) => {
                error!(error = ?error, job = %job.describe(), "JobRouter failure: failed to finalize job: {error}");
                // keep the source job from leaving its queue
                self.set_job_idle(job);
            }
        }

        self.gracefully_remove(job);
    }

    /// put the source job on hold or remove it if the route's periodic policy says so,
    /// returns whether the job has to leave the route
    fn apply_periodic_policy(&self, job: &mut RoutedJob) -> bool {
        let Some(route) = self.routes.get(&job.route_name) else {
            return false;
        };
        let fires =
            |policy: &Predicate| self.matcher.matches(policy, route.route_ad(), &job.src_ad);

        let mut attributes = BTreeMap::new();
        if let Some(policy) = route.periodic_remove().filter(|policy| fires(*policy)) {
            attributes.insert(attr::JOB_STATUS.to_owned(), Value::from(JobStatus::Removed));
            attributes.insert(
                attr::REMOVE_REASON.to_owned(),
                Value::from(format!("The periodic_remove policy ({policy}) evaluated to true")),
            );
        } else if let Some(policy) = route.periodic_hold().filter(|policy| fires(*policy)) {
            attributes.insert(attr::JOB_STATUS.to_owned(), Value::from(JobStatus::Held));
            attributes.insert(
                attr::HOLD_REASON.to_owned(),
                Value::from(format!("The periodic_hold policy ({policy}) evaluated to true")),
            );
            attributes.insert(attr::HOLD_REASON_CODE.to_owned(), Value::from(POLICY_HOLD_CODE));
            attributes.insert(attr::HOLD_REASON_SUBCODE.to_owned(), Value::from(0));
            // a policy hold is not released on yield
            attributes.insert(attr::HOLD_COPIED_FROM_TARGET_JOB.to_owned(), Value::Undefined);
        } else {
            return false;
        }
        attributes.insert(
            attr::ENTERED_CURRENT_STATUS.to_owned(),
            Value::from(self.clock.now()),
        );

        if let Err(error) = self.source.push_attributes(&job.src_key, &attributes) {
            error!(error = ?error, job = %job.describe(), "JobRouter failure: failed to apply periodic policy to src job: {error}");
            return false;
        }

        for (name, value) in attributes {
            if value == Value::Undefined {
                job.src_ad.remove(&name);
            } else {
                job.src_ad.insert(name, value);
            }
        }
        job.src_ad.clear_dirty();
        info!(job = %job.describe(), status = ?job.src_ad.status(), "JobRouter: periodic policy applied to src job");

        true
    }

    fn set_job_idle(&self, job: &mut RoutedJob) {
        job.src_ad.insert(attr::JOB_STATUS, JobStatus::Idle);
        // our copy may already say idle while the queue does not
        let mut attributes = job.src_ad.dirty_attributes();
        attributes.insert(attr::JOB_STATUS.to_owned(), Value::from(JobStatus::Idle));

        match self.source.push_attributes(&job.src_key, &attributes) {
            Ok(()) => job.src_ad.clear_dirty(),
            Err(error) => {
                error!(error = ?error, job = %job.describe(), "JobRouter failure: failed to set src job status back to idle: {error}")
            }
        }
    }

    fn test_job_success(&self, job: &RoutedJob) -> bool {
        let Some(route) = self.routes.get(&job.route_name) else {
            return true;
        };

        match route.job_failure_test() {
            // undefined counts as success
            Some(test) => !self.matcher.matches(test, route.route_ad(), &job.src_ad),
            None => true,
        }
    }

    pub(crate) fn cleanup_job(&mut self, job: &mut RoutedJob) {
        if job.state != JobState::Cleanup {
            return;
        }

        if !job.is_done && !job.dest_removed {
            // the key stays, retirement still has to see the routed copy leave the mirror
            if let Some(dest_key) = job.dest_key.clone() {
                match self
                    .destination
                    .remove_job(&job.dest_ad, &dest_key, "JobRouter aborted job")
                {
                    Ok(()) => {
                        debug!(job = %job.describe(), "JobRouter: removed dest job");
                        job.dest_removed = true;
                    }
                    Err(error) => {
                        error!(error = ?error, job = %job.describe(), "JobRouter: failed to remove dest job: {error}")
                    }
                }
            }
        }

        if job.is_claimed {
            match self.source.yield_job(
                &job.src_ad,
                job.is_done,
                &job.src_key,
                &self.name,
                self.release_on_hold,
            ) {
                Ok(()) => {
                    debug!(job = %job.describe(), done = job.is_done, "JobRouter: yielded job");
                }
                Err(error) => {
                    error!(error = ?error, job = %job.describe(), "JobRouter: failed to yield job: {error}");

                    // a vanished source job cannot be yielded anymore
                    let source_gone = self.source.get_ad(&job.src_key).is_none();
                    if error.keep_trying && !source_gone {
                        return;
                    }
                }
            }

            job.is_claimed = false;
        }

        debug!(job = %job.describe(), "JobRouter: cleaned up and removed routed job");

        if let Some(route) = self.routes.get_mut(&job.route_name) {
            if job.is_success {
                route.increment_successes();
            } else {
                route.increment_failures();
            }
        }

        // stay in the table until the mirror catches up, or the job looks like an orphan
        job.state = JobState::Retired;
        job.retirement_time = self.clock.now();
        job.route_name.clear();
    }

    /// returns false once the mirror no longer attributes the job to this router
    pub(crate) fn cleanup_retired_job(&self, job: &RoutedJob) -> bool {
        if job.state != JobState::Retired {
            return true;
        }

        // a missing source could be mirror lag, only an observed source counts
        let src_synchronized = self.source.get_ad(&job.src_key).map_or(false, |ad| {
            ad.get_str(attr::MANAGED) != Some(managed::EXTERNAL)
                || ad.get_str(attr::MANAGED_MANAGER) != Some(self.name.as_str())
        });
        let dest_synchronized = match job.dest_key {
            Some(ref dest_key) => self
                .destination
                .get_ad(dest_key)
                .map_or(true, |ad| ad.get_str(attr::ROUTED_BY) != Some(self.name.as_str())),
            None => true,
        };

        if src_synchronized && dest_synchronized {
            debug!(job = %job.describe(), "JobRouter: job mirror synchronized; removing job from internal 'retirement' status");
            return false;
        }

        let retired_for = self.clock.now() - job.retirement_time;
        if retired_for >= self.max_job_mirror_update_lag {
            debug!(
                job = %job.describe(),
                "JobRouter: job mirror still not synchronized after {retired_for} seconds; removing job from internal 'retirement' status"
            );
            return false;
        }

        true
    }
}
