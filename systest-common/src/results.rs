//! Per-module result aggregation.
//!
//! Each test case reports up to three phase outcomes (setup, call,
//! teardown). They merge into one outcome per test case, and those merge
//! into the module verdict, using the precedence `failed > skipped > passed`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Outcome of one test-case phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Skipped,
    Failed,
}

impl Outcome {
    /// Position in the merge precedence; higher wins.
    fn rank(self) -> u8 {
        match self {
            Self::Passed => 0,
            Self::Skipped => 1,
            Self::Failed => 2,
        }
    }

    /// The worse of two outcomes.
    pub fn merge(self, other: Outcome) -> Outcome {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Phase of a test case that produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Call,
    Teardown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Call => write!(f, "call"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

/// Module-level verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed,
    Skipped,
    /// No result was ever recorded; the module never got to run a test.
    Error,
}

impl From<Outcome> for Verdict {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Passed => Self::Passed,
            Outcome::Skipped => Self::Skipped,
            Outcome::Failed => Self::Failed,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Merged result of one test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub id: String,
    pub outcome: Outcome,
    pub messages: Vec<String>,
}

/// Collects test-case results for one module run.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    results: BTreeMap<String, TestCaseResult>,
    order: Vec<String>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one phase outcome into the stored result for `test_case_id`.
    pub fn record(
        &mut self,
        test_case_id: &str,
        phase: Phase,
        outcome: Outcome,
        message: Option<String>,
    ) {
        debug!(test_case = test_case_id, %phase, %outcome, "recording test result");
        if !self.results.contains_key(test_case_id) {
            self.order.push(test_case_id.to_string());
        }
        let entry = self
            .results
            .entry(test_case_id.to_string())
            .or_insert_with(|| TestCaseResult {
                id: test_case_id.to_string(),
                outcome,
                messages: Vec::new(),
            });
        entry.outcome = entry.outcome.merge(outcome);
        if let Some(message) = message
            && !message.trim().is_empty()
        {
            entry.messages.push(message);
        }
    }

    pub fn get(&self, test_case_id: &str) -> Option<&TestCaseResult> {
        self.results.get(test_case_id)
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Results in the order test cases were first recorded.
    pub fn results(&self) -> Vec<TestCaseResult> {
        self.order
            .iter()
            .filter_map(|id| self.results.get(id).cloned())
            .collect()
    }

    /// All failure detail, in recording order.
    pub fn messages(&self) -> Vec<String> {
        self.order
            .iter()
            .filter_map(|id| self.results.get(id))
            .flat_map(|result| result.messages.iter().cloned())
            .collect()
    }

    /// Module verdict: `Error` if nothing was recorded, else the worst outcome.
    pub fn verdict(&self) -> Verdict {
        self.results
            .values()
            .map(|result| result.outcome)
            .reduce(Outcome::merge)
            .map(Verdict::from)
            .unwrap_or(Verdict::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn outcome() -> impl Strategy<Value = Outcome> {
        prop_oneof![
            Just(Outcome::Passed),
            Just(Outcome::Skipped),
            Just(Outcome::Failed)
        ]
    }

    #[test]
    fn test_empty_aggregator_is_error() {
        assert_eq!(ResultAggregator::new().verdict(), Verdict::Error);
    }

    #[test]
    fn test_merge_precedence() {
        use Outcome::*;
        assert_eq!(Passed.merge(Skipped), Skipped);
        assert_eq!(Skipped.merge(Passed), Skipped);
        assert_eq!(Skipped.merge(Failed), Failed);
        assert_eq!(Failed.merge(Passed), Failed);
        assert_eq!(Passed.merge(Passed), Passed);
    }

    #[test]
    fn test_passed_passed_skipped_is_skipped() {
        let mut agg = ResultAggregator::new();
        for id in ["alpha::a", "alpha::b"] {
            agg.record(id, Phase::Setup, Outcome::Passed, None);
            agg.record(id, Phase::Call, Outcome::Passed, None);
            agg.record(id, Phase::Teardown, Outcome::Passed, None);
        }
        agg.record("alpha::c", Phase::Setup, Outcome::Skipped, Some("no tools".into()));
        assert_eq!(agg.verdict(), Verdict::Skipped);
    }

    #[test]
    fn test_teardown_failure_overrides_passed_call() {
        let mut agg = ResultAggregator::new();
        agg.record("m::t", Phase::Setup, Outcome::Passed, None);
        agg.record("m::t", Phase::Call, Outcome::Passed, None);
        agg.record(
            "m::t",
            Phase::Teardown,
            Outcome::Failed,
            Some("stop script exited with 1".into()),
        );
        assert_eq!(agg.get("m::t").unwrap().outcome, Outcome::Failed);
        assert_eq!(agg.verdict(), Verdict::Failed);
    }

    #[test]
    fn test_failed_is_not_downgraded_by_later_pass() {
        let mut agg = ResultAggregator::new();
        agg.record("m::t", Phase::Call, Outcome::Failed, Some("boom".into()));
        agg.record("m::t", Phase::Teardown, Outcome::Passed, None);
        assert_eq!(agg.get("m::t").unwrap().outcome, Outcome::Failed);
    }

    #[test]
    fn test_messages_concatenate_non_empty_only() {
        let mut agg = ResultAggregator::new();
        agg.record("m::a", Phase::Call, Outcome::Failed, Some("first".into()));
        agg.record("m::a", Phase::Teardown, Outcome::Passed, Some("  ".into()));
        agg.record("m::b", Phase::Call, Outcome::Failed, Some("second".into()));
        assert_eq!(agg.messages(), vec!["first", "second"]);
    }

    #[test]
    fn test_results_keep_recording_order() {
        let mut agg = ResultAggregator::new();
        agg.record("m::zz", Phase::Call, Outcome::Passed, None);
        agg.record("m::aa", Phase::Call, Outcome::Passed, None);
        let ids: Vec<String> = agg.results().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["m::zz", "m::aa"]);
    }

    proptest! {
        #[test]
        fn prop_verdict_is_worst_recorded_outcome(
            records in prop::collection::vec((0usize..4, outcome()), 1..24)
        ) {
            let mut agg = ResultAggregator::new();
            for (case, outcome) in &records {
                agg.record(&format!("m::t{case}"), Phase::Call, *outcome, None);
            }
            let worst = records
                .iter()
                .map(|(_, outcome)| *outcome)
                .max_by_key(|outcome| outcome.rank())
                .unwrap();
            prop_assert_eq!(agg.verdict(), Verdict::from(worst));
        }

        #[test]
        fn prop_merge_is_order_independent(a in outcome(), b in outcome(), c in outcome()) {
            prop_assert_eq!(a.merge(b).merge(c), c.merge(a).merge(b));
        }
    }
}
