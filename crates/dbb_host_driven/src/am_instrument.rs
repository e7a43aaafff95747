//! Parsing of `am instrument -r` raw output.

use std::collections::BTreeMap;

use dbb_utils::{
    results::{ResultType, TestResult},
    time::EpochMillis,
};

const STATUS_PREFIX: &str = "INSTRUMENTATION_STATUS: ";
const STATUS_CODE_PREFIX: &str = "INSTRUMENTATION_STATUS_CODE: ";
const RESULT_PREFIX: &str = "INSTRUMENTATION_RESULT: ";
const CODE_PREFIX: &str = "INSTRUMENTATION_CODE: ";
const FAILED_PREFIX: &str = "INSTRUMENTATION_FAILED: ";

pub const STATUS_CODE_START: i32 = 1;
pub const STATUS_CODE_OK: i32 = 0;
pub const STATUS_CODE_ERROR: i32 = -1;
pub const STATUS_CODE_FAILURE: i32 = -2;
pub const STATUS_CODE_IGNORED: i32 = -3;
pub const STATUS_CODE_ASSUMPTION_FAILURE: i32 = -4;

/// One `INSTRUMENTATION_STATUS` block, closed by its status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationStatus {
    pub code: i32,
    pub values: BTreeMap<String, String>,
}

impl InstrumentationStatus {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstrumentationOutput {
    pub statuses: Vec<InstrumentationStatus>,
    pub result: BTreeMap<String, String>,
    /// The instrumentation's own exit code; absent if the process died first.
    pub code: Option<i32>,
}

#[derive(Clone, Copy)]
enum Section {
    Status,
    Result,
}

/// Splits raw instrumentation output into status blocks. Values may span several lines
/// (stack traces do); a line without a known prefix continues the previous value.
pub fn parse(raw: &str) -> InstrumentationOutput {
    let mut output = InstrumentationOutput::default();
    let mut pending = BTreeMap::new();
    let mut last_key: Option<(Section, String)> = None;

    for line in raw.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(rest) = line.strip_prefix(STATUS_PREFIX) {
            let (key, value) = split_key_value(rest);
            pending.insert(key.to_owned(), value.to_owned());
            last_key = Some((Section::Status, key.to_owned()));
        } else if let Some(rest) = line.strip_prefix(STATUS_CODE_PREFIX) {
            let code = rest.trim().parse().unwrap_or(STATUS_CODE_ERROR);
            output.statuses.push(InstrumentationStatus {
                code,
                values: std::mem::take(&mut pending),
            });
            last_key = None;
        } else if let Some(rest) = line.strip_prefix(RESULT_PREFIX) {
            let (key, value) = split_key_value(rest);
            output.result.insert(key.to_owned(), value.to_owned());
            last_key = Some((Section::Result, key.to_owned()));
        } else if let Some(rest) = line.strip_prefix(CODE_PREFIX) {
            output.code = rest.trim().parse().ok();
            last_key = None;
        } else if let Some(rest) = line.strip_prefix(FAILED_PREFIX) {
            output.result.insert("failed".to_owned(), rest.to_owned());
            last_key = None;
        } else if let Some((section, key)) = &last_key {
            let values = match section {
                Section::Status => &mut pending,
                Section::Result => &mut output.result,
            };
            if let Some(value) = values.get_mut(key) {
                value.push('\n');
                value.push_str(line);
            }
        }
    }

    output
}

fn split_key_value(rest: &str) -> (&str, &str) {
    rest.split_once('=').unwrap_or((rest, ""))
}

pub fn result_type_for_code(code: i32) -> ResultType {
    match code {
        STATUS_CODE_OK => ResultType::Pass,
        STATUS_CODE_FAILURE => ResultType::Fail,
        STATUS_CODE_ERROR => ResultType::Crash,
        STATUS_CODE_IGNORED | STATUS_CODE_ASSUMPTION_FAILURE => ResultType::Skip,
        _ => ResultType::Unknown,
    }
}

/// The outcome of a single-test instrumentation run. A test that started but never
/// completed crashed its process.
pub fn single_test_result(
    test_id: &str,
    output: &InstrumentationOutput,
    start_time: EpochMillis,
    duration_ms: u64,
) -> TestResult {
    let completed = output
        .statuses
        .iter()
        .rev()
        .find(|status| status.code != STATUS_CODE_START);

    let (result_type, log) = match completed {
        Some(status) => (
            result_type_for_code(status.code),
            status.get("stack").unwrap_or_default().to_owned(),
        ),
        None => {
            let reason = output
                .result
                .get("shortMsg")
                .or_else(|| output.result.get("failed"))
                .map(String::as_str)
                .unwrap_or("instrumentation did not report a test completion");
            (ResultType::Crash, reason.to_owned())
        }
    };

    TestResult::new(test_id, result_type, start_time, duration_ms).with_log(log)
}
