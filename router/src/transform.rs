use crate::ad::{attr, JobAd, JobStatus, Universe, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("Source job has no valid JobStatus")]
    MissingSourceStatus,
    #[error("Routed job has no valid JobStatus")]
    MissingDestinationStatus,
}

/// Rewrites job ads for a remote resource and mirrors remote status back
pub trait UniverseTransform {
    /// build the routed copy of `src`, targeting `grid_resource`
    fn to_grid(&self, src: &JobAd, grid_resource: &str) -> JobAd;

    /// reflect the state of `dest` onto `src_copy`, `mirror_src` is the current source ad
    fn update_status(
        &self,
        mirror_src: &JobAd,
        dest: &JobAd,
        src_copy: &mut JobAd,
    ) -> Result<(), TransformError>;
}

// execution bookkeeping owned by the queue that runs the job
const QUEUE_LOCAL_ATTRIBUTES: [&str; 12] = [
    attr::CLUSTER_ID,
    attr::PROC_ID,
    attr::MANAGED,
    attr::MANAGED_MANAGER,
    attr::HOLD_REASON,
    attr::HOLD_REASON_CODE,
    attr::HOLD_REASON_SUBCODE,
    attr::HOLD_COPIED_FROM_TARGET_JOB,
    attr::RELEASE_REASON,
    attr::REMOVE_REASON,
    attr::ROUTED_TO_JOB_ID,
    "GlobalJobId",
];

// progress reported by the remote side that the source job should show
const PROGRESS_ATTRIBUTES: [&str; 7] = [
    "ImageSize",
    "RemoteWallClockTime",
    "RemoteUserCpu",
    "RemoteSysCpu",
    "JobStartDate",
    "NumJobStarts",
    "LastRemoteHost",
];

const EXIT_ATTRIBUTES: [&str; 6] = [
    "ExitCode",
    "ExitBySignal",
    "ExitSignal",
    "ExitStatus",
    "CompletionDate",
    attr::JOB_FINISHED_HOOK_DONE,
];

#[derive(Debug, Clone, Copy, Default)]
pub struct GridTransform;

impl GridTransform {
    fn copy_from(dest: &JobAd, src_copy: &mut JobAd, names: &[&str]) {
        for name in names {
            if let Some(value) = dest.get(name) {
                src_copy.insert(*name, value.clone());
            }
        }
    }

    fn set_status(dest: &JobAd, src_copy: &mut JobAd, status: JobStatus) {
        if src_copy.status() == Some(status) {
            return;
        }

        src_copy.insert(attr::JOB_STATUS, status);
        if let Some(entered) = dest.get(attr::ENTERED_CURRENT_STATUS) {
            src_copy.insert(attr::ENTERED_CURRENT_STATUS, entered.clone());
        }
    }
}

impl UniverseTransform for GridTransform {
    fn to_grid(&self, src: &JobAd, grid_resource: &str) -> JobAd {
        let mut dest = src.clone();

        for name in QUEUE_LOCAL_ATTRIBUTES {
            dest.remove(name);
        }
        dest.insert(attr::JOB_UNIVERSE, Universe::Grid);
        dest.insert(attr::GRID_RESOURCE, grid_resource);
        dest.insert(attr::JOB_STATUS, JobStatus::Idle);
        dest.clear_dirty();

        dest
    }

    fn update_status(
        &self,
        mirror_src: &JobAd,
        dest: &JobAd,
        src_copy: &mut JobAd,
    ) -> Result<(), TransformError> {
        let src_status = mirror_src
            .status()
            .ok_or(TransformError::MissingSourceStatus)?;
        let dest_status = dest
            .status()
            .ok_or(TransformError::MissingDestinationStatus)?;
        let hold_is_ours =
            mirror_src.get_bool(attr::HOLD_COPIED_FROM_TARGET_JOB) == Some(true);

        Self::copy_from(dest, src_copy, &PROGRESS_ATTRIBUTES);

        // never touch a hold the user placed on the source job
        if src_status == JobStatus::Held && !hold_is_ours {
            return Ok(());
        }

        match dest_status {
            JobStatus::Held => {
                Self::copy_from(
                    dest,
                    src_copy,
                    &[
                        attr::HOLD_REASON,
                        attr::HOLD_REASON_CODE,
                        attr::HOLD_REASON_SUBCODE,
                    ],
                );
                src_copy.insert(attr::HOLD_COPIED_FROM_TARGET_JOB, true);
                Self::set_status(dest, src_copy, JobStatus::Held);
            }
            JobStatus::Removed => {
                // the router decides what a removed routed job means
            }
            status => {
                if src_status == JobStatus::Held {
                    src_copy.remove(attr::HOLD_COPIED_FROM_TARGET_JOB);
                    src_copy.insert(
                        attr::RELEASE_REASON,
                        dest.get(attr::RELEASE_REASON)
                            .cloned()
                            .unwrap_or_else(|| Value::from("Routed job was released")),
                    );
                }

                let mapped = match status {
                    JobStatus::TransferringOutput => JobStatus::Running,
                    other => other,
                };
                if mapped == JobStatus::Completed {
                    Self::copy_from(dest, src_copy, &EXIT_ATTRIBUTES);
                }
                Self::set_status(dest, src_copy, mapped);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> JobAd {
        [
            (attr::CLUSTER_ID, Value::from(3)),
            (attr::PROC_ID, Value::from(0)),
            (attr::OWNER, Value::from("alice")),
            (attr::JOB_UNIVERSE, Value::from(Universe::Vanilla)),
            (attr::JOB_STATUS, Value::from(JobStatus::Idle)),
            (attr::MANAGED, Value::from("External")),
            (attr::MANAGED_MANAGER, Value::from("router")),
        ]
        .into_iter()
        .collect()
    }

    fn destination(status: JobStatus) -> JobAd {
        let mut dest = GridTransform.to_grid(&source(), "batch slurm");
        dest.insert(attr::JOB_STATUS, status);
        dest
    }

    #[test]
    fn grid_copy_drops_queue_bookkeeping() {
        let dest = GridTransform.to_grid(&source(), "batch slurm");

        assert_eq!(dest.get_int(attr::JOB_UNIVERSE), Some(Universe::Grid as i64));
        assert_eq!(dest.get_str(attr::GRID_RESOURCE), Some("batch slurm"));
        assert_eq!(dest.get_str(attr::OWNER), Some("alice"));
        assert!(!dest.contains(attr::CLUSTER_ID));
        assert!(!dest.contains(attr::MANAGED));
        assert!(!dest.is_dirty());
    }

    #[test]
    fn remote_hold_is_copied_with_marker() {
        let mirror = source();
        let mut copy = source();
        let mut dest = destination(JobStatus::Held);
        dest.insert(attr::HOLD_REASON, "Proxy expired");
        dest.insert(attr::HOLD_REASON_CODE, 21);
        dest.insert(attr::HOLD_REASON_SUBCODE, 4);

        GridTransform.update_status(&mirror, &dest, &mut copy).unwrap();

        assert_eq!(copy.status(), Some(JobStatus::Held));
        assert_eq!(copy.get_int(attr::HOLD_REASON_CODE), Some(21));
        assert_eq!(copy.get_int(attr::HOLD_REASON_SUBCODE), Some(4));
        assert_eq!(copy.get_bool(attr::HOLD_COPIED_FROM_TARGET_JOB), Some(true));
    }

    #[test]
    fn release_of_mirrored_hold_clears_marker() {
        let mut mirror = source();
        mirror.insert(attr::JOB_STATUS, JobStatus::Held);
        mirror.insert(attr::HOLD_COPIED_FROM_TARGET_JOB, true);
        let mut copy = mirror.clone();

        GridTransform
            .update_status(&mirror, &destination(JobStatus::Running), &mut copy)
            .unwrap();

        assert_eq!(copy.status(), Some(JobStatus::Running));
        assert!(!copy.contains(attr::HOLD_COPIED_FROM_TARGET_JOB));
        assert!(copy.contains(attr::RELEASE_REASON));
    }

    #[test]
    fn user_hold_is_left_alone() {
        let mut mirror = source();
        mirror.insert(attr::JOB_STATUS, JobStatus::Held);
        let mut copy = mirror.clone();
        copy.clear_dirty();

        GridTransform
            .update_status(&mirror, &destination(JobStatus::Running), &mut copy)
            .unwrap();

        assert_eq!(copy.status(), Some(JobStatus::Held));
        assert!(!copy.is_dirty());
    }

    #[test]
    fn completion_carries_exit_attributes() {
        let mirror = source();
        let mut copy = source();
        let mut dest = destination(JobStatus::Completed);
        dest.insert("ExitCode", 0);
        dest.insert(attr::JOB_FINISHED_HOOK_DONE, 1_700_000_000i64);

        GridTransform.update_status(&mirror, &dest, &mut copy).unwrap();

        assert_eq!(copy.status(), Some(JobStatus::Completed));
        assert_eq!(copy.get_int("ExitCode"), Some(0));
    }

    #[test]
    fn missing_status_is_an_error() {
        let mut dest = destination(JobStatus::Idle);
        dest.remove(attr::JOB_STATUS);

        assert_eq!(
            GridTransform.update_status(&source(), &dest, &mut source()),
            Err(TransformError::MissingDestinationStatus)
        );
    }
}
