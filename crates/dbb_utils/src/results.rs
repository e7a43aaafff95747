//! Test results as reported upward to buildbot reporting.
//!
//! Both Java instrumentation tests and host-driven tests report through these types; a
//! host-driven test folds the results of the Java tests it ran into one [TestResult].

use serde_derive::{Deserialize, Serialize};

use crate::time::EpochMillis;

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultType {
    /// An explicit test success.
    Pass,
    /// A test that was not run, e.g. because an assumption did not hold.
    Skip,
    /// An explicit test failure.
    Fail,
    /// The test, or the process hosting it, crashed.
    Crash,
    /// The test did not finish in time.
    Timeout,
    /// The runner produced no classifiable outcome.
    Unknown,
}

impl ResultType {
    pub fn is_pass(&self) -> bool {
        matches!(self, ResultType::Pass)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultType::Pass => "PASS",
            ResultType::Skip => "SKIP",
            ResultType::Fail => "FAIL",
            ResultType::Crash => "CRASH",
            ResultType::Timeout => "TIMEOUT",
            ResultType::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ResultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    pub name: String,
    pub result_type: ResultType,
    pub start_time: EpochMillis,
    pub duration_ms: u64,
    /// Failure output, or empty.
    pub log: String,
}

impl TestResult {
    pub fn new(
        name: impl Into<String>,
        result_type: ResultType,
        start_time: EpochMillis,
        duration_ms: u64,
    ) -> Self {
        Self {
            name: name.into(),
            result_type,
            start_time,
            duration_ms,
            log: String::new(),
        }
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = log.into();
        self
    }
}

/// An ordered collection of results from one run.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TestRunResults {
    results: Vec<TestResult>,
}

impl TestRunResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(result: TestResult) -> Self {
        Self {
            results: vec![result],
        }
    }

    pub fn all(&self) -> &[TestResult] {
        &self.results
    }

    /// Every result that is not an explicit pass. Skips count as not passing.
    pub fn not_pass(&self) -> impl Iterator<Item = &TestResult> {
        self.results.iter().filter(|r| !r.result_type.is_pass())
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

impl IntoIterator for TestRunResults {
    type Item = TestResult;
    type IntoIter = std::vec::IntoIter<TestResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

#[cfg(test)]
mod test {
    use super::{ResultType, TestResult, TestRunResults};
    use crate::time::EpochMillis;

    fn result(name: &str, ty: ResultType) -> TestResult {
        TestResult::new(name, ty, EpochMillis::from_millis(0), 10)
    }

    #[test]
    fn empty_run_has_no_failures() {
        assert_eq!(TestRunResults::new().not_pass().count(), 0);
    }

    #[test]
    fn skip_is_not_a_pass() {
        let results = TestRunResults {
            results: vec![result("a", ResultType::Pass), result("b", ResultType::Skip)],
        };

        let not_pass: Vec<_> = results.not_pass().map(|r| r.name.as_str()).collect();
        assert_eq!(not_pass, ["b"]);
    }

    #[test]
    fn serializes_result_type_like_the_dashboards_expect() {
        let json = serde_json::to_string(&ResultType::Timeout).unwrap();
        assert_eq!(json, r#""TIMEOUT""#);
    }
}
