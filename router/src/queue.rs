pub mod memory;
pub mod spool;

use crate::{
    ad::{attr, managed, JobAd, JobKey, JobStatus, Value},
    predicate::Predicate,
};
use std::{collections::BTreeMap, io};
use thiserror::Error;

pub use memory::MemoryQueue;
pub use spool::SpoolQueue;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job {0} does not exist")]
    NoSuchJob(JobKey),
    #[error("Job {0} is not in a state that permits this operation: {1}")]
    InvalidState(JobKey, String),
    #[error("{0} is not a valid job id")]
    InvalidKey(JobKey),
    #[error("Queue rejected the request: {0}")]
    Rejected(String),
    #[error("Spool directory could not be accessed")]
    Io(#[from] io::Error),
    #[error("Spooled job is not valid YAML")]
    InvalidYaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    Ok,
    // someone else holds the job or it is not idle anymore
    Busy,
    Error(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct YieldError {
    pub message: String,
    // false if retrying cannot succeed, e.g. the job is managed by someone else
    pub keep_trying: bool,
}

impl YieldError {
    pub fn new(message: impl Into<String>, keep_trying: bool) -> Self {
        Self {
            message: message.into(),
            keep_trying,
        }
    }
}

/// Possibly stale, read-only view of a job queue
pub trait JobQueueMirror {
    fn get_ad(&self, key: &JobKey) -> Option<JobAd>;
    fn query(&self, constraint: &Predicate) -> Vec<JobKey>;
}

/// Mutating operations on a job queue
pub trait QueueProtocolClient {
    fn claim_job(&self, ad: &JobAd, key: &JobKey, identity: &str) -> ClaimResult;
    fn yield_job(
        &self,
        ad: &JobAd,
        done: bool,
        key: &JobKey,
        identity: &str,
        release_on_hold: bool,
    ) -> Result<(), YieldError>;
    fn submit_job(&self, ad: &JobAd) -> Result<JobKey, QueueError>;
    fn finalize_job(&self, ad: &JobAd, key: &JobKey) -> Result<(), QueueError>;
    fn remove_job(&self, ad: &JobAd, key: &JobKey, reason: &str) -> Result<(), QueueError>;
    fn push_attributes(
        &self,
        key: &JobKey,
        attributes: &BTreeMap<String, Value>,
    ) -> Result<(), QueueError>;
}

/// A queue the router can both observe and drive
pub trait JobQueue: JobQueueMirror + QueueProtocolClient {}

impl<T: JobQueueMirror + QueueProtocolClient> JobQueue for T {}

/// What is left of a job after it was yielded back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Yielded {
    Kept,
    // the job was removed while we held it and can go away now
    Destroyed,
}

pub(crate) fn claim_ad(ad: &mut JobAd, identity: &str) -> ClaimResult {
    if ad.get_str(attr::MANAGED) == Some(managed::EXTERNAL) {
        return ClaimResult::Busy;
    }
    if ad.status() != Some(JobStatus::Idle) {
        return ClaimResult::Busy;
    }

    ad.insert(attr::MANAGED, managed::EXTERNAL);
    ad.insert(attr::MANAGED_MANAGER, identity);

    ClaimResult::Ok
}

pub(crate) fn yield_ad(
    ad: &mut JobAd,
    done: bool,
    identity: &str,
    release_on_hold: bool,
) -> Result<Yielded, YieldError> {
    if ad.get_str(attr::MANAGED) != Some(managed::EXTERNAL) {
        return Err(YieldError::new("job is not managed externally", false));
    }
    match ad.get_str(attr::MANAGED_MANAGER) {
        Some(manager) if manager == identity => {}
        other => {
            return Err(YieldError::new(
                format!(
                    "job is managed by {}, not by {identity}",
                    other.unwrap_or("nobody")
                ),
                false,
            ))
        }
    }

    ad.insert(
        attr::MANAGED,
        if done { managed::DONE } else { managed::SCHEDD },
    );
    ad.remove(attr::MANAGED_MANAGER);

    let status = ad.status();
    if status == Some(JobStatus::Removed) {
        return Ok(Yielded::Destroyed);
    }

    if status != Some(JobStatus::Idle) && status != Some(JobStatus::Completed) {
        let held = status == Some(JobStatus::Held);
        let mirrored_hold = ad.get_bool(attr::HOLD_COPIED_FROM_TARGET_JOB) == Some(true);

        if held && release_on_hold && mirrored_hold {
            ad.remove(attr::HOLD_COPIED_FROM_TARGET_JOB);
            ad.insert(attr::JOB_STATUS, JobStatus::Idle);
        } else if !held {
            ad.insert(attr::JOB_STATUS, JobStatus::Idle);
        }
    }

    Ok(Yielded::Kept)
}

/// apply pushed attributes, `Undefined` deletes
pub(crate) fn apply_attributes(ad: &mut JobAd, attributes: &BTreeMap<String, Value>) {
    for (name, value) in attributes.iter() {
        if value.is_undefined() {
            ad.remove(name);
        } else {
            ad.insert(name.as_str(), value.clone());
        }
    }
}

pub(crate) fn check_finalizable(ad: &JobAd, key: &JobKey) -> Result<(), QueueError> {
    match ad.status() {
        Some(JobStatus::Completed) => Ok(()),
        status => Err(QueueError::InvalidState(
            key.clone(),
            format!("expected a completed job, found status {status:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_job() -> JobAd {
        [
            (attr::OWNER, Value::from("alice")),
            (attr::JOB_STATUS, Value::from(JobStatus::Idle)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn claim_requires_an_idle_unmanaged_job() {
        let mut ad = idle_job();

        assert_eq!(claim_ad(&mut ad, "router"), ClaimResult::Ok);
        assert_eq!(ad.get_str(attr::MANAGED_MANAGER), Some("router"));
        assert_eq!(claim_ad(&mut ad, "other"), ClaimResult::Busy);

        let mut running = idle_job();
        running.insert(attr::JOB_STATUS, JobStatus::Running);
        assert_eq!(claim_ad(&mut running, "router"), ClaimResult::Busy);
    }

    #[test]
    fn yield_by_a_foreign_manager_is_final() {
        let mut ad = idle_job();
        claim_ad(&mut ad, "router");

        let error = yield_ad(&mut ad, false, "other", true).unwrap_err();
        assert!(!error.keep_trying);

        let mut unmanaged = idle_job();
        assert!(!yield_ad(&mut unmanaged, false, "router", true)
            .unwrap_err()
            .keep_trying);
    }

    #[test]
    fn yield_releases_mirrored_holds_only() {
        let mut ad = idle_job();
        claim_ad(&mut ad, "router");
        ad.insert(attr::JOB_STATUS, JobStatus::Held);
        ad.insert(attr::HOLD_COPIED_FROM_TARGET_JOB, true);

        assert_eq!(yield_ad(&mut ad, false, "router", true), Ok(Yielded::Kept));
        assert_eq!(ad.status(), Some(JobStatus::Idle));
        assert_eq!(ad.get_str(attr::MANAGED), Some(managed::SCHEDD));
        assert!(!ad.contains(attr::MANAGED_MANAGER));
        assert!(!ad.contains(attr::HOLD_COPIED_FROM_TARGET_JOB));

        let mut user_hold = idle_job();
        claim_ad(&mut user_hold, "router");
        user_hold.insert(attr::JOB_STATUS, JobStatus::Held);
        yield_ad(&mut user_hold, true, "router", true).unwrap();
        assert_eq!(user_hold.status(), Some(JobStatus::Held));
        assert_eq!(user_hold.get_str(attr::MANAGED), Some(managed::DONE));
    }

    #[test]
    fn yield_of_a_removed_job_destroys_it() {
        let mut ad = idle_job();
        claim_ad(&mut ad, "router");
        ad.insert(attr::JOB_STATUS, JobStatus::Removed);

        assert_eq!(yield_ad(&mut ad, false, "router", true), Ok(Yielded::Destroyed));
    }
}
