use super::{
    apply_attributes, check_finalizable, claim_ad, yield_ad, ClaimResult, JobQueueMirror,
    QueueError, QueueProtocolClient, YieldError, Yielded,
};
use crate::{
    ad::{attr, JobAd, JobKey, Value},
    predicate::Predicate,
};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, error};

const JOB_SUFFIX: &str = ".yaml";
const COUNTER_FILE: &str = ".next_cluster";

/// Job queue kept as one YAML file per job in a directory
///
/// Every write goes to a hidden temporary file first and is renamed into
/// place, so concurrent readers only ever see complete job ads.
#[derive(Debug)]
pub struct SpoolQueue {
    directory: PathBuf,
    // serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl SpoolQueue {
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;

        Ok(Self {
            directory,
            lock: Mutex::new(()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    // keys come from job ads, anything but `<cluster>.<proc>` could leave the directory
    fn path(&self, key: &JobKey) -> Result<PathBuf, QueueError> {
        if key.ids().is_none() {
            return Err(QueueError::InvalidKey(key.clone()));
        }

        Ok(self.directory.join(format!("{key}{JOB_SUFFIX}")))
    }

    fn read(&self, key: &JobKey) -> Result<Option<JobAd>, QueueError> {
        match fs::read_to_string(self.path(key)?) {
            Ok(content) => Ok(Some(serde_yaml::from_str(&content)?)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn write_atomically(&self, path: &Path, content: &str) -> Result<(), QueueError> {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temporary = path.with_file_name(format!(".{file_name}.tmp"));

        fs::write(&temporary, content)?;
        fs::rename(&temporary, path)?;

        Ok(())
    }

    fn write(&self, key: &JobKey, ad: &JobAd) -> Result<(), QueueError> {
        self.write_atomically(&self.path(key)?, &serde_yaml::to_string(ad)?)
    }

    fn delete(&self, key: &JobKey) -> Result<bool, QueueError> {
        match fs::remove_file(self.path(key)?) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    pub fn keys(&self) -> Result<Vec<JobKey>, QueueError> {
        let mut keys = Vec::new();

        for entry in fs::read_dir(&self.directory)? {
            let file_name = entry?.file_name();
            let file_name = file_name.to_string_lossy();

            if file_name.starts_with('.') {
                continue;
            }
            if let Some(key) = file_name.strip_suffix(JOB_SUFFIX).map(JobKey::new) {
                if key.ids().is_some() {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn next_cluster(&self) -> Result<i64, QueueError> {
        let counter_path = self.directory.join(COUNTER_FILE);
        let stored = match fs::read_to_string(&counter_path) {
            Ok(content) => content.trim().parse::<i64>().unwrap_or(1),
            Err(error) if error.kind() == ErrorKind::NotFound => 1,
            Err(error) => return Err(error.into()),
        };
        let highest = self
            .keys()?
            .iter()
            .filter_map(|key| key.ids().map(|(cluster, _)| cluster))
            .max()
            .unwrap_or(0);

        let cluster = stored.max(highest + 1);
        self.write_atomically(&counter_path, &(cluster + 1).to_string())?;

        Ok(cluster)
    }

    /// spool a new job under a fresh cluster id
    pub fn insert_job(&self, ad: &JobAd) -> Result<JobKey, QueueError> {
        let _guard = self.lock.lock();

        let cluster = self.next_cluster()?;
        let key = JobKey::from_ids(cluster, 0);

        let mut ad = ad.clone();
        ad.insert(attr::CLUSTER_ID, cluster);
        ad.insert(attr::PROC_ID, 0);
        self.write(&key, &ad)?;

        Ok(key)
    }

    fn modify<T>(
        &self,
        key: &JobKey,
        change: impl FnOnce(&mut JobAd) -> T,
    ) -> Result<T, QueueError> {
        let mut ad = self
            .read(key)?
            .ok_or_else(|| QueueError::NoSuchJob(key.clone()))?;

        let result = change(&mut ad);
        self.write(key, &ad)?;

        Ok(result)
    }
}

impl JobQueueMirror for SpoolQueue {
    fn get_ad(&self, key: &JobKey) -> Option<JobAd> {
        match self.read(key) {
            Ok(ad) => ad,
            Err(error) => {
                error!(error = ?error, job = %key, "Failed to read spooled job: {error}");
                None
            }
        }
    }

    fn query(&self, constraint: &Predicate) -> Vec<JobKey> {
        let keys = match self.keys() {
            Ok(keys) => keys,
            Err(error) => {
                error!(error = ?error, directory = ?self.directory, "Failed to list spool directory: {error}");
                return Vec::new();
            }
        };

        keys.into_iter()
            .filter(|key| {
                self.get_ad(key)
                    .map(|ad| constraint.matches(&ad))
                    .unwrap_or(false)
            })
            .collect()
    }
}

impl QueueProtocolClient for SpoolQueue {
    fn claim_job(&self, _ad: &JobAd, key: &JobKey, identity: &str) -> ClaimResult {
        let _guard = self.lock.lock();

        match self.modify(key, |ad| claim_ad(ad, identity)) {
            Ok(result) => result,
            Err(error) => ClaimResult::Error(error.to_string()),
        }
    }

    fn yield_job(
        &self,
        _ad: &JobAd,
        done: bool,
        key: &JobKey,
        identity: &str,
        release_on_hold: bool,
    ) -> Result<(), YieldError> {
        let _guard = self.lock.lock();

        let mut ad = match self.read(key) {
            Ok(Some(ad)) => ad,
            Ok(None) => return Err(YieldError::new(format!("job {key} does not exist"), false)),
            Err(error @ QueueError::InvalidKey(_)) => {
                return Err(YieldError::new(error.to_string(), false))
            }
            Err(error) => return Err(YieldError::new(error.to_string(), true)),
        };

        let outcome = yield_ad(&mut ad, done, identity, release_on_hold)?;
        let stored = match outcome {
            Yielded::Kept => self.write(key, &ad),
            Yielded::Destroyed => {
                debug!(job = %key, "Destroying removed job after yield");
                self.delete(key).map(|_| ())
            }
        };

        stored.map_err(|error| YieldError::new(error.to_string(), true))
    }

    fn submit_job(&self, ad: &JobAd) -> Result<JobKey, QueueError> {
        self.insert_job(ad)
    }

    fn finalize_job(&self, _ad: &JobAd, key: &JobKey) -> Result<(), QueueError> {
        let _guard = self.lock.lock();

        let ad = self
            .read(key)?
            .ok_or_else(|| QueueError::NoSuchJob(key.clone()))?;
        check_finalizable(&ad, key)?;
        self.delete(key)?;

        Ok(())
    }

    fn remove_job(&self, _ad: &JobAd, key: &JobKey, reason: &str) -> Result<(), QueueError> {
        let _guard = self.lock.lock();

        if self.delete(key)? {
            debug!(job = %key, "Removed job: {reason}");
            Ok(())
        } else {
            Err(QueueError::NoSuchJob(key.clone()))
        }
    }

    fn push_attributes(
        &self,
        key: &JobKey,
        attributes: &BTreeMap<String, Value>,
    ) -> Result<(), QueueError> {
        let _guard = self.lock.lock();

        self.modify(key, |ad| apply_attributes(ad, attributes))
    }
}
