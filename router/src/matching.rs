use crate::{ad::JobAd, predicate::Predicate};

/// Evaluates route predicates against job ads
pub trait MatchEngine {
    /// evaluate `predicate` held by `my` against `target`, `None` means undefined
    fn evaluate(&self, predicate: &Predicate, my: &JobAd, target: &JobAd) -> Option<bool>;

    /// bidirectional match: the predicate of `my` must hold for `target`
    fn matches(&self, predicate: &Predicate, my: &JobAd, target: &JobAd) -> bool {
        self.evaluate(predicate, my, target) == Some(true)
    }
}

/// Default engine for structured predicates
#[derive(Debug, Clone, Copy, Default)]
pub struct PredicateMatcher;

impl MatchEngine for PredicateMatcher {
    fn evaluate(&self, predicate: &Predicate, my: &JobAd, target: &JobAd) -> Option<bool> {
        predicate.evaluate(Some(my), target)
    }
}
