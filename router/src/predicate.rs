use crate::ad::{JobAd, Value};
use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_yaml::with::singleton_map;
use std::{
    cmp::Ordering,
    fmt::{self, Display},
};

/// Which ad an attribute reference resolves against
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// the job being matched
    #[default]
    Target,
    /// the ad holding the predicate, e.g. the route
    My,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Term {
    pub attr: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub scope: Scope,
}

/// Structured boolean predicate over job attributes
///
/// Comparisons follow three valued logic: a comparison against an undefined
/// attribute is undefined (`None`), `is`/`is_not` compare identity and are
/// always defined.
///
/// In YAML each operator is a single key map, e.g. `eq: {attr: Owner, value: alice}`.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Const(bool),
    Eq(Term),
    Ne(Term),
    Lt(Term),
    Le(Term),
    Gt(Term),
    Ge(Term),
    Is(Term),
    IsNot(Term),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
}

// wire form of `Predicate`, read and written through `singleton_map`
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
enum Operator {
    Const(bool),
    Eq(Term),
    Ne(Term),
    Lt(Term),
    Le(Term),
    Gt(Term),
    Ge(Term),
    Is(Term),
    IsNot(Term),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl From<Operator> for Predicate {
    fn from(operator: Operator) -> Self {
        match operator {
            Operator::Const(value) => Self::Const(value),
            Operator::Eq(term) => Self::Eq(term),
            Operator::Ne(term) => Self::Ne(term),
            Operator::Lt(term) => Self::Lt(term),
            Operator::Le(term) => Self::Le(term),
            Operator::Gt(term) => Self::Gt(term),
            Operator::Ge(term) => Self::Ge(term),
            Operator::Is(term) => Self::Is(term),
            Operator::IsNot(term) => Self::IsNot(term),
            Operator::All(predicates) => Self::All(predicates),
            Operator::Any(predicates) => Self::Any(predicates),
            Operator::Not(predicate) => Self::Not(predicate),
        }
    }
}

impl From<Predicate> for Operator {
    fn from(predicate: Predicate) -> Self {
        match predicate {
            Predicate::Const(value) => Self::Const(value),
            Predicate::Eq(term) => Self::Eq(term),
            Predicate::Ne(term) => Self::Ne(term),
            Predicate::Lt(term) => Self::Lt(term),
            Predicate::Le(term) => Self::Le(term),
            Predicate::Gt(term) => Self::Gt(term),
            Predicate::Ge(term) => Self::Ge(term),
            Predicate::Is(term) => Self::Is(term),
            Predicate::IsNot(term) => Self::IsNot(term),
            Predicate::All(predicates) => Self::All(predicates),
            Predicate::Any(predicates) => Self::Any(predicates),
            Predicate::Not(predicate) => Self::Not(predicate),
        }
    }
}

impl<'de> Deserialize<'de> for Predicate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let operator: Operator = singleton_map::deserialize(deserializer)?;
        Ok(operator.into())
    }
}

impl Serialize for Predicate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        singleton_map::serialize(&Operator::from(self.clone()), serializer)
    }
}

fn term(attr: &str, value: impl Into<Value>) -> Term {
    Term {
        attr: attr.to_owned(),
        value: value.into(),
        scope: Scope::Target,
    }
}

impl Predicate {
    pub fn eq(attr: &str, value: impl Into<Value>) -> Self {
        Self::Eq(term(attr, value))
    }

    pub fn ge(attr: &str, value: impl Into<Value>) -> Self {
        Self::Ge(term(attr, value))
    }

    pub fn is(attr: &str, value: impl Into<Value>) -> Self {
        Self::Is(term(attr, value))
    }

    pub fn is_not(attr: &str, value: impl Into<Value>) -> Self {
        Self::IsNot(term(attr, value))
    }

    pub fn defined(attr: &str) -> Self {
        Self::IsNot(term(attr, Value::Undefined))
    }

    /// evaluate against `target`, resolving `my` references against `my` if given
    pub fn evaluate(&self, my: Option<&JobAd>, target: &JobAd) -> Option<bool> {
        let resolve = |term: &Term| match term.scope {
            Scope::Target => target.lookup(&term.attr),
            Scope::My => my.map(|ad| ad.lookup(&term.attr)).unwrap_or_default(),
        };

        match self {
            Self::Const(value) => Some(*value),
            Self::Eq(term) => loose_eq(&resolve(term), &term.value),
            Self::Ne(term) => loose_eq(&resolve(term), &term.value).map(|equal| !equal),
            Self::Lt(term) => compare(&resolve(term), &term.value).map(Ordering::is_lt),
            Self::Le(term) => compare(&resolve(term), &term.value).map(Ordering::is_le),
            Self::Gt(term) => compare(&resolve(term), &term.value).map(Ordering::is_gt),
            Self::Ge(term) => compare(&resolve(term), &term.value).map(Ordering::is_ge),
            Self::Is(term) => Some(resolve(term) == term.value),
            Self::IsNot(term) => Some(resolve(term) != term.value),
            Self::All(predicates) => {
                let mut result = Some(true);

                for predicate in predicates {
                    match predicate.evaluate(my, target) {
                        Some(false) => return Some(false),
                        None => result = None,
                        Some(true) => {}
                    }
                }

                result
            }
            Self::Any(predicates) => {
                let mut result = Some(false);

                for predicate in predicates {
                    match predicate.evaluate(my, target) {
                        Some(true) => return Some(true),
                        None => result = None,
                        Some(false) => {}
                    }
                }

                result
            }
            Self::Not(predicate) => predicate.evaluate(my, target).map(|value| !value),
        }
    }

    /// true iff the predicate evaluates to true against `target` alone
    pub fn matches(&self, target: &JobAd) -> bool {
        self.evaluate(None, target) == Some(true)
    }

    /// resolve all `my` references against `my`, undefined comparisons become false
    pub fn bind(&self, my: &JobAd) -> Predicate {
        match self {
            Self::Eq(term)
            | Self::Ne(term)
            | Self::Lt(term)
            | Self::Le(term)
            | Self::Gt(term)
            | Self::Ge(term)
            | Self::Is(term)
            | Self::IsNot(term)
                if term.scope == Scope::My =>
            {
                Self::Const(self.evaluate(Some(my), &JobAd::new()).unwrap_or(false))
            }
            Self::All(predicates) => Self::All(predicates.iter().map(|p| p.bind(my)).collect()),
            Self::Any(predicates) => Self::Any(predicates.iter().map(|p| p.bind(my)).collect()),
            Self::Not(predicate) => Self::Not(Box::new(predicate.bind(my))),
            _ => self.clone(),
        }
    }
}

fn loose_eq(left: &Value, right: &Value) -> Option<bool> {
    match (left, right) {
        (Value::Undefined, _) | (_, Value::Undefined) => None,
        (Value::Str(left), Value::Str(right)) => Some(left.eq_ignore_ascii_case(right)),
        (Value::Bool(left), Value::Bool(right)) => Some(left == right),
        _ => compare(left, right).map(Ordering::is_eq),
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Str(left), Value::Str(right)) => {
            Some(left.to_lowercase().cmp(&right.to_lowercase()))
        }
        (Value::Int(_) | Value::Real(_), Value::Int(_) | Value::Real(_)) => {
            left.as_real()?.partial_cmp(&right.as_real()?)
        }
        _ => None,
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Scope::Target => write!(f, "TARGET.{}", self.attr),
            Scope::My => write!(f, "MY.{}", self.attr),
        }
    }
}

impl Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Const(value) => write!(f, "{value}"),
            Self::Eq(term) => write!(f, "{term} == {}", term.value),
            Self::Ne(term) => write!(f, "{term} != {}", term.value),
            Self::Lt(term) => write!(f, "{term} < {}", term.value),
            Self::Le(term) => write!(f, "{term} <= {}", term.value),
            Self::Gt(term) => write!(f, "{term} > {}", term.value),
            Self::Ge(term) => write!(f, "{term} >= {}", term.value),
            Self::Is(term) => write!(f, "{term} is {}", term.value),
            Self::IsNot(term) => write!(f, "{term} isnt {}", term.value),
            Self::All(predicates) if predicates.is_empty() => write!(f, "true"),
            Self::Any(predicates) if predicates.is_empty() => write!(f, "false"),
            Self::All(predicates) => {
                write!(f, "({})", predicates.iter().map(|p| p.to_string()).join(" && "))
            }
            Self::Any(predicates) => {
                write!(f, "({})", predicates.iter().map(|p| p.to_string()).join(" || "))
            }
            Self::Not(predicate) => write!(f, "!({predicate})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::attr;

    fn job() -> JobAd {
        [
            (attr::OWNER, Value::from("alice")),
            (attr::JOB_STATUS, Value::from(1)),
            (attr::JOB_UNIVERSE, Value::from(5)),
            ("RequestMemory", Value::from(2048.0)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn comparisons_against_undefined_are_undefined() {
        let job = job();

        assert_eq!(Predicate::eq("Missing", 1).evaluate(None, &job), None);
        assert_eq!(Predicate::is("Missing", Value::Undefined).evaluate(None, &job), Some(true));
        assert_eq!(Predicate::defined(attr::OWNER).evaluate(None, &job), Some(true));
    }

    #[test]
    fn numbers_and_strings_compare_loosely() {
        let job = job();

        assert!(Predicate::eq(attr::OWNER, "ALICE").matches(&job));
        assert!(!Predicate::is(attr::OWNER, "ALICE").matches(&job));
        assert!(Predicate::ge("RequestMemory", 2048).matches(&job));
        assert!(Predicate::eq(attr::JOB_UNIVERSE, 5.0).matches(&job));
    }

    #[test]
    fn connectives_short_circuit_over_undefined() {
        let job = job();
        let undefined = Predicate::eq("Missing", 1);

        assert_eq!(
            Predicate::All(vec![undefined.clone(), Predicate::Const(false)]).evaluate(None, &job),
            Some(false)
        );
        assert_eq!(
            Predicate::Any(vec![undefined.clone(), Predicate::Const(true)]).evaluate(None, &job),
            Some(true)
        );
        assert_eq!(
            Predicate::All(vec![undefined, Predicate::Const(true)]).evaluate(None, &job),
            None
        );
    }

    #[test]
    fn my_scope_reads_the_route_ad() {
        let route: JobAd = [("Site", Value::from("alpha"))].into_iter().collect();
        let job = job();
        let predicate: Predicate =
            serde_yaml::from_str("eq: {attr: Site, value: alpha, scope: my}").unwrap();

        assert_eq!(predicate.evaluate(Some(&route), &job), Some(true));
        assert_eq!(predicate.evaluate(None, &job), None);
        assert_eq!(predicate.bind(&route), Predicate::Const(true));
    }

    #[test]
    fn parses_nested_yaml() {
        let predicate: Predicate = serde_yaml::from_str(
            "all:\n  - eq: {attr: JobUniverse, value: 5}\n  - not:\n      eq: {attr: Owner, value: bob}\n",
        )
        .unwrap();

        assert!(predicate.matches(&job()));
        assert_eq!(
            predicate.to_string(),
            "(TARGET.JobUniverse == 5 && !(TARGET.Owner == \"bob\"))"
        );
    }

    #[test]
    fn single_key_maps_survive_a_yaml_round_trip() {
        let predicate = Predicate::Any(vec![
            Predicate::Not(Box::new(Predicate::eq(attr::OWNER, "bob"))),
            Predicate::Const(false),
        ]);
        let yaml = serde_yaml::to_string(&predicate).unwrap();

        assert!(!yaml.contains('!'), "{yaml}");
        assert_eq!(serde_yaml::from_str::<Predicate>(&yaml).unwrap(), predicate);
    }

    #[test]
    fn unknown_operators_are_rejected() {
        assert!(serde_yaml::from_str::<Predicate>("like: {attr: Owner, value: a}").is_err());
        assert!(serde_yaml::from_str::<Predicate>(
            "eq: {attr: Owner, value: a}\nne: {attr: Owner, value: b}"
        )
        .is_err());
    }
}
