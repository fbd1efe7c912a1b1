use super::{
    apply_attributes, check_finalizable, claim_ad, yield_ad, ClaimResult, JobQueueMirror,
    QueueError, QueueProtocolClient, YieldError, Yielded,
};
use crate::{
    ad::{attr, JobAd, JobKey, JobStatus, Value},
    predicate::Predicate,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Protocol operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Operation {
    Claim,
    Yield,
    Submit,
    Finalize,
    Remove,
    Push,
}

#[derive(Debug)]
struct Queue {
    live: BTreeMap<JobKey, JobAd>,
    // what readers see, only refreshed by `sync_mirror`
    mirror: BTreeMap<JobKey, JobAd>,
    next_cluster: i64,
    failing: BTreeSet<Operation>,
}

/// In-process job queue with an explicitly synchronized mirror
///
/// Protocol operations act on the live queue immediately while
/// `JobQueueMirror` reads a snapshot, which makes mirror lag observable.
#[derive(Debug)]
pub struct MemoryQueue {
    queue: Mutex<Queue>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MemoryQueue {
    pub fn new(first_cluster: i64) -> Self {
        Self {
            queue: Mutex::new(Queue {
                live: BTreeMap::new(),
                mirror: BTreeMap::new(),
                next_cluster: first_cluster,
                failing: BTreeSet::new(),
            }),
        }
    }

    /// add a job to the live queue, keeping its ids if it carries some
    pub fn insert_job(&self, mut ad: JobAd) -> JobKey {
        let mut queue = self.queue.lock();

        let key = match (ad.get_int(attr::CLUSTER_ID), ad.get_int(attr::PROC_ID)) {
            (Some(cluster), Some(proc)) => {
                queue.next_cluster = queue.next_cluster.max(cluster + 1);
                JobKey::from_ids(cluster, proc)
            }
            _ => {
                let cluster = queue.next_cluster;
                queue.next_cluster += 1;
                ad.insert(attr::CLUSTER_ID, cluster);
                ad.insert(attr::PROC_ID, 0);
                JobKey::from_ids(cluster, 0)
            }
        };

        ad.clear_dirty();
        queue.live.insert(key.clone(), ad);

        key
    }

    /// publish the live queue to the mirror
    pub fn sync_mirror(&self) {
        let mut queue = self.queue.lock();
        queue.mirror = queue.live.clone();
    }

    pub fn live_ad(&self, key: &JobKey) -> Option<JobAd> {
        self.queue.lock().live.get(key).cloned()
    }

    pub fn live_keys(&self) -> Vec<JobKey> {
        self.queue.lock().live.keys().cloned().collect()
    }

    /// change a live job the way its owner or the batch system would
    pub fn set_attribute(&self, key: &JobKey, name: &str, value: impl Into<Value>) -> bool {
        match self.queue.lock().live.get_mut(key) {
            Some(ad) => {
                ad.insert(name, value);
                true
            }
            None => false,
        }
    }

    pub fn delete_job(&self, key: &JobKey) -> Option<JobAd> {
        self.queue.lock().live.remove(key)
    }

    pub fn fail(&self, operation: Operation) {
        self.queue.lock().failing.insert(operation);
    }

    pub fn heal(&self, operation: Operation) {
        self.queue.lock().failing.remove(&operation);
    }

    fn injected(queue: &Queue, operation: Operation) -> Result<(), QueueError> {
        if queue.failing.contains(&operation) {
            Err(QueueError::Rejected(format!("{operation:?} failure injected")))
        } else {
            Ok(())
        }
    }
}

impl JobQueueMirror for MemoryQueue {
    fn get_ad(&self, key: &JobKey) -> Option<JobAd> {
        self.queue.lock().mirror.get(key).cloned()
    }

    fn query(&self, constraint: &Predicate) -> Vec<JobKey> {
        self.queue
            .lock()
            .mirror
            .iter()
            .filter(|(_, ad)| constraint.matches(ad))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

impl QueueProtocolClient for MemoryQueue {
    fn claim_job(&self, _ad: &JobAd, key: &JobKey, identity: &str) -> ClaimResult {
        let mut queue = self.queue.lock();

        if let Err(error) = Self::injected(&queue, Operation::Claim) {
            return ClaimResult::Error(error.to_string());
        }

        match queue.live.get_mut(key) {
            Some(ad) => claim_ad(ad, identity),
            None => ClaimResult::Error(format!("job {key} does not exist")),
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
        let mut queue = self.queue.lock();

        if let Err(error) = Self::injected(&queue, Operation::Yield) {
            return Err(YieldError::new(error.to_string(), true));
        }

        let ad = queue
            .live
            .get_mut(key)
            .ok_or_else(|| YieldError::new(format!("job {key} does not exist"), false))?;

        if yield_ad(ad, done, identity, release_on_hold)? == Yielded::Destroyed {
            debug!(job = %key, "Destroying removed job after yield");
            queue.live.remove(key);
        }

        Ok(())
    }

    fn submit_job(&self, ad: &JobAd) -> Result<JobKey, QueueError> {
        {
            let queue = self.queue.lock();
            Self::injected(&queue, Operation::Submit)?;
        }

        let mut ad = ad.clone();
        ad.remove(attr::CLUSTER_ID);
        ad.remove(attr::PROC_ID);

        Ok(self.insert_job(ad))
    }

    fn finalize_job(&self, _ad: &JobAd, key: &JobKey) -> Result<(), QueueError> {
        let mut queue = self.queue.lock();
        Self::injected(&queue, Operation::Finalize)?;

        let ad = queue
            .live
            .get(key)
            .ok_or_else(|| QueueError::NoSuchJob(key.clone()))?;
        check_finalizable(ad, key)?;

        // a finalized job leaves the queue
        queue.live.remove(key);

        Ok(())
    }

    fn remove_job(&self, _ad: &JobAd, key: &JobKey, reason: &str) -> Result<(), QueueError> {
        let mut queue = self.queue.lock();
        Self::injected(&queue, Operation::Remove)?;

        match queue.live.remove(key) {
            Some(_) => {
                debug!(job = %key, "Removed job: {reason}");
                Ok(())
            }
            None => Err(QueueError::NoSuchJob(key.clone())),
        }
    }

    fn push_attributes(
        &self,
        key: &JobKey,
        attributes: &BTreeMap<String, Value>,
    ) -> Result<(), QueueError> {
        let mut queue = self.queue.lock();
        Self::injected(&queue, Operation::Push)?;

        let ad = queue
            .live
            .get_mut(key)
            .ok_or_else(|| QueueError::NoSuchJob(key.clone()))?;
        apply_attributes(ad, attributes);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(owner: &str) -> JobAd {
        [
            (attr::OWNER, Value::from(owner)),
            (attr::JOB_STATUS, Value::from(JobStatus::Idle)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn mirror_lags_until_synced() {
        let queue = MemoryQueue::default();
        let key = queue.insert_job(job("alice"));

        assert!(queue.get_ad(&key).is_none());
        queue.sync_mirror();
        assert_eq!(queue.get_ad(&key).unwrap().get_str(attr::OWNER), Some("alice"));

        queue.set_attribute(&key, attr::OWNER, "bob");
        assert_eq!(queue.get_ad(&key).unwrap().get_str(attr::OWNER), Some("alice"));
    }

    #[test]
    fn submitted_jobs_get_fresh_ids() {
        let queue = MemoryQueue::new(100);
        let source = queue.insert_job(job("alice"));
        let source_ad = queue.live_ad(&source).unwrap();

        let routed = queue.submit_job(&source_ad).unwrap();

        assert_eq!(source, JobKey::from("100.0"));
        assert_eq!(routed, JobKey::from("101.0"));
        assert_eq!(queue.live_ad(&routed).unwrap().get_int(attr::CLUSTER_ID), Some(101));
    }

    #[test]
    fn query_filters_the_mirror() {
        let queue = MemoryQueue::default();
        queue.insert_job(job("alice"));
        let bob = queue.insert_job(job("bob"));
        queue.sync_mirror();

        assert_eq!(queue.query(&Predicate::eq(attr::OWNER, "bob")), vec![bob]);
    }

    #[test]
    fn finalize_requires_completion() {
        let queue = MemoryQueue::default();
        let key = queue.insert_job(job("alice"));
        let ad = queue.live_ad(&key).unwrap();

        assert!(queue.finalize_job(&ad, &key).is_err());
        queue.set_attribute(&key, attr::JOB_STATUS, JobStatus::Completed);
        assert!(queue.finalize_job(&ad, &key).is_ok());
        assert!(queue.live_ad(&key).is_none());
    }

    #[test]
    fn injected_failures_can_be_healed() {
        let queue = MemoryQueue::default();
        let key = queue.insert_job(job("alice"));
        let ad = queue.live_ad(&key).unwrap();

        queue.fail(Operation::Claim);
        assert!(matches!(queue.claim_job(&ad, &key, "router"), ClaimResult::Error(_)));
        queue.heal(Operation::Claim);
        assert_eq!(queue.claim_job(&ad, &key, "router"), ClaimResult::Ok);
    }
}
