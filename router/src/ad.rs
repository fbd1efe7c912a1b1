use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{
    collections::{btree_map, BTreeMap, BTreeSet},
    fmt::{self, Display},
};

/// Attribute names shared by the router and the queue adapters
pub mod attr {
    pub const CLUSTER_ID: &str = "ClusterId";
    pub const PROC_ID: &str = "ProcId";
    pub const OWNER: &str = "Owner";
    pub const NT_DOMAIN: &str = "NTDomain";
    pub const JOB_STATUS: &str = "JobStatus";
    pub const JOB_UNIVERSE: &str = "JobUniverse";
    pub const ENTERED_CURRENT_STATUS: &str = "EnteredCurrentStatus";
    pub const GRID_RESOURCE: &str = "GridResource";

    pub const MANAGED: &str = "Managed";
    pub const MANAGED_MANAGER: &str = "ManagedManager";

    pub const HOLD_REASON: &str = "HoldReason";
    pub const HOLD_REASON_CODE: &str = "HoldReasonCode";
    pub const HOLD_REASON_SUBCODE: &str = "HoldReasonSubCode";
    pub const HOLD_COPIED_FROM_TARGET_JOB: &str = "HoldCopiedFromTargetJob";
    pub const RELEASE_REASON: &str = "ReleaseReason";
    pub const REMOVE_REASON: &str = "RemoveReason";
    pub const JOB_FINISHED_HOOK_DONE: &str = "JobFinishedHookDone";

    pub const ROUTED_FROM_JOB_ID: &str = "RoutedFromJobId";
    pub const ROUTED_TO_JOB_ID: &str = "RoutedToJobId";
    pub const ROUTED_BY: &str = "RoutedBy";
    pub const ROUTE_NAME: &str = "RouteName";
}

/// values of the `Managed` attribute
pub mod managed {
    pub const SCHEDD: &str = "Schedd";
    pub const EXTERNAL: &str = "External";
    pub const DONE: &str = "ScheddDone";
}

/// A single attribute value of a job or route ad
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Undefined,
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(String),
}

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Bool(value) => Some(*value as i64),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Real(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::Int(value) => Some(*value != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Real(value) => write!(f, "{value}"),
            Self::Str(value) => write!(f, "\"{value}\""),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<JobStatus> for Value {
    fn from(value: JobStatus) -> Self {
        Self::Int(value as i64)
    }
}

/// Opaque identifier of a job inside a queue, `<cluster>.<proc>` for the bundled adapters
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn from_ids(cluster: i64, proc: i64) -> Self {
        Self(format!("{cluster}.{proc}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// cluster and proc id, `None` unless the key is `<cluster>.<proc>` in plain digits
    pub fn ids(&self) -> Option<(i64, i64)> {
        let (cluster, proc) = self.0.split_once('.')?;
        let id = |part: &str| {
            if part.is_empty() || !part.bytes().all(|byte| byte.is_ascii_digit()) {
                return None;
            }
            part.parse::<i64>().ok()
        };

        Some((id(cluster)?, id(proc)?))
    }
}

impl Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobKey {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}

#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum JobStatus {
    Idle = 1,
    Running = 2,
    Removed = 3,
    Completed = 4,
    Held = 5,
    TransferringOutput = 6,
    Suspended = 7,
}

impl JobStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Idle),
            2 => Some(Self::Running),
            3 => Some(Self::Removed),
            4 => Some(Self::Completed),
            5 => Some(Self::Held),
            6 => Some(Self::TransferringOutput),
            7 => Some(Self::Suspended),
            _ => None,
        }
    }
}

#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum Universe {
    Vanilla = 5,
    Grid = 9,
}

impl From<Universe> for Value {
    fn from(value: Universe) -> Self {
        Self::Int(value as i64)
    }
}

/// Attribute map with dirty tracking, used for job ads and route ads alike
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(transparent)]
pub struct JobAd {
    attributes: BTreeMap<String, Value>,
    #[serde(skip)]
    dirty: BTreeSet<String>,
    #[serde(skip)]
    tracking_paused: bool,
}

impl PartialEq for JobAd {
    fn eq(&self, other: &Self) -> bool {
        self.attributes == other.attributes
    }
}

impl JobAd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// missing attributes evaluate to `Undefined`
    pub fn lookup(&self, name: &str) -> Value {
        self.attributes.get(name).cloned().unwrap_or_default()
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_int)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn status(&self) -> Option<JobStatus> {
        self.get_int(attr::JOB_STATUS).and_then(JobStatus::from_code)
    }

    /// insert a value, marking the attribute dirty if it changed
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();

        if self.attributes.get(&name) == Some(&value) {
            return;
        }

        if !self.tracking_paused {
            self.dirty.insert(name.clone());
        }
        self.attributes.insert(name, value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let removed = self.attributes.remove(name);

        if removed.is_some() && !self.tracking_paused {
            self.dirty.insert(name.to_owned());
        }

        removed
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.attributes.iter()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn pause_tracking(&mut self) {
        self.tracking_paused = true;
    }

    pub fn resume_tracking(&mut self) {
        self.tracking_paused = false;
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    /// changed attributes since the last `clear_dirty`, removals are reported as `Undefined`
    pub fn dirty_attributes(&self) -> BTreeMap<String, Value> {
        self.dirty
            .iter()
            .map(|name| (name.clone(), self.lookup(name)))
            .collect()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for JobAd {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            attributes: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
            ..Self::default()
        }
    }
}

impl From<BTreeMap<String, Value>> for JobAd {
    fn from(attributes: BTreeMap<String, Value>) -> Self {
        Self {
            attributes,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_keys_only_parse_plain_ids() {
        assert_eq!(JobKey::from("12.3").ids(), Some((12, 3)));
        assert_eq!(JobKey::from_ids(7, 0).ids(), Some((7, 0)));

        for key in ["", "12", "12.", ".3", "+1.0", "1.0.0", "../1.0", "1.0/x"] {
            assert_eq!(JobKey::from(key).ids(), None, "{key}");
        }
    }

    #[test]
    fn dirty_tracking_reports_changes_and_removals() {
        let mut ad: JobAd = [("Owner", Value::from("alice")), ("JobStatus", Value::from(1))]
            .into_iter()
            .collect();

        assert!(!ad.is_dirty());

        // unchanged values do not count
        ad.insert(attr::JOB_STATUS, JobStatus::Idle);
        assert!(!ad.is_dirty());

        ad.insert(attr::JOB_STATUS, JobStatus::Held);
        ad.remove(attr::OWNER);

        let dirty = ad.dirty_attributes();
        assert_eq!(dirty.len(), 2);
        assert_eq!(dirty.get(attr::JOB_STATUS), Some(&Value::Int(5)));
        assert_eq!(dirty.get(attr::OWNER), Some(&Value::Undefined));

        ad.clear_dirty();
        assert!(!ad.is_dirty());
    }

    #[test]
    fn paused_tracking_is_silent() {
        let mut ad = JobAd::new();

        ad.pause_tracking();
        ad.insert("A", 1);
        ad.resume_tracking();
        ad.insert("B", 2);

        assert_eq!(
            ad.dirty_attributes().into_keys().collect::<Vec<_>>(),
            vec!["B".to_owned()]
        );
    }

    #[test]
    fn yaml_values_deserialize_untagged() {
        let ad: JobAd =
            serde_yaml::from_str("{Owner: bob, JobStatus: 1, Rank: 0.5, Ok: true, Gone: ~}")
                .unwrap();

        assert_eq!(ad.get_str("Owner"), Some("bob"));
        assert_eq!(ad.status(), Some(JobStatus::Idle));
        assert_eq!(ad.get("Rank"), Some(&Value::Real(0.5)));
        assert_eq!(ad.get_bool("Ok"), Some(true));
        assert!(ad.lookup("Gone").is_undefined());
        assert!(ad.lookup("Missing").is_undefined());
    }
}
