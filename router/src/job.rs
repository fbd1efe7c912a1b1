use crate::ad::{JobAd, JobKey};
use std::fmt::{self, Display};

/// Lifecycle of a routed job, transitions only move forward except for the
/// escape to `Cleanup`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobState {
    Unclaimed,
    Claimed,
    Submitted,
    Finished,
    Cleanup,
    Retired,
}

impl Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unclaimed => "UNCLAIMED",
            Self::Claimed => "CLAIMED",
            Self::Submitted => "SUBMITTED",
            Self::Finished => "FINISHED",
            Self::Cleanup => "CLEANUP",
            Self::Retired => "RETIRED",
        };

        f.write_str(name)
    }
}

/// Router-side record of one source job and its routed copy
#[derive(Debug, Clone)]
pub struct RoutedJob {
    pub state: JobState,
    pub src_key: JobKey,
    // None until the routed copy was submitted, kept after its removal
    pub dest_key: Option<JobKey>,
    pub dest_removed: bool,
    // may name a route that no longer exists after a reload
    pub route_name: String,
    pub grid_resource: String,
    pub is_claimed: bool,
    pub is_done: bool,
    pub is_success: bool,
    pub is_running: bool,
    pub saw_dest_job: bool,
    pub submission_time: i64,
    pub retirement_time: i64,
    // router's copy of the source ad, dirty attributes are pushed back to the queue
    pub src_ad: JobAd,
    pub dest_ad: JobAd,
}

impl RoutedJob {
    pub fn new(src_key: JobKey, src_ad: JobAd, route_name: impl Into<String>) -> Self {
        Self {
            state: JobState::Unclaimed,
            src_key,
            dest_key: None,
            dest_removed: false,
            route_name: route_name.into(),
            grid_resource: String::new(),
            is_claimed: false,
            is_done: false,
            is_success: false,
            is_running: false,
            saw_dest_job: false,
            submission_time: 0,
            retirement_time: 0,
            src_ad,
            dest_ad: JobAd::new(),
        }
    }

    /// `src=…,dest=…,route=…` for log lines
    pub fn describe(&self) -> String {
        let mut description = format!("src={}", self.src_key);

        if let Some(ref dest_key) = self.dest_key {
            description.push_str(&format!(",dest={dest_key}"));
        }
        if !self.route_name.is_empty() {
            description.push_str(&format!(",route={}", self.route_name));
        }

        description
    }

    pub fn has_route(&self) -> bool {
        !self.route_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_skips_unknown_parts() {
        let mut job = RoutedJob::new(JobKey::from_ids(12, 0), JobAd::new(), "site-a");

        assert_eq!(job.describe(), "src=12.0,route=site-a");

        job.dest_key = Some(JobKey::from_ids(40, 0));
        job.route_name.clear();
        assert_eq!(job.describe(), "src=12.0,dest=40.0");
    }

    #[test]
    fn states_are_ordered_along_the_lifecycle() {
        assert!(JobState::Unclaimed < JobState::Claimed);
        assert!(JobState::Finished < JobState::Cleanup);
        assert!(JobState::Cleanup < JobState::Retired);
    }
}
