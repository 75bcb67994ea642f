//! Post-run script validation.
//!
//! Runs after quiescence, so it never competes with the transport layer.
//! Test scripts are Postman-style: `pm.test("name", …)` blocks whose bodies
//! assert on the response. The evaluator discovers each block, evaluates
//! the assertion vocabulary it understands, and produces a pass/fail list;
//! anything the sandbox cannot parse fails that block with a script error
//! rather than aborting the whole validation.
//!
//! Supported expectations:
//! - `pm.response.to.have.status(200)`
//! - `pm.expect(pm.response.code).to.equal(200)`
//! - `pm.expect(pm.response.responseTime).to.be.below(500)`
//! - `pm.response.to.have.header("content-type")`
//! - `pm.expect(pm.response.text()).to.include("ok")`
//! - `pm.expect(pm.response.json().a.b).to.equal(…)` / `.to.exist`, also
//!   through a `var data = pm.response.json();` alias

use regex::Regex;
use serde_json::Value;
use serde_json_path::JsonPath;
use tracing::{debug, info, warn};

use crate::config::parse_request;
use crate::metrics::now_ms;
use crate::run::RunContext;
use crate::store::{Metric, MetricName, ResultRow, RunStore};
use crate::types::{Environment, Request, Response};

/// Cap on retained failure messages per run.
const MAX_FAILURE_MESSAGES: usize = 50;

/// One assertion block's outcome.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub error_message: String,
}

/// Whole-script outcome.
#[derive(Debug, Clone)]
pub struct ScriptResult {
    /// False only when the script itself could not be evaluated.
    pub success: bool,
    pub tests: Vec<TestResult>,
    pub error_message: String,
}

/// Postman-style test script evaluator.
pub struct ScriptEngine {
    test_block: Regex,
    test_name: Regex,
    json_alias: Regex,
    status_have: Regex,
    code_equal: Regex,
    time_below: Regex,
    header_have: Regex,
    body_include: Regex,
    json_expect: Regex,
}

impl ScriptEngine {
    pub fn new() -> Self {
        Self {
            test_block: Regex::new(r"pm\.test\s*\(").unwrap(),
            test_name: Regex::new(r#"^\s*(?:"([^"]*)"|'([^']*)')"#).unwrap(),
            json_alias: Regex::new(r"(?:var|let|const)\s+(\w+)\s*=\s*pm\.response\.json\(\)")
                .unwrap(),
            status_have: Regex::new(r"pm\.response\.to\.have\.status\(\s*(\d+)\s*\)").unwrap(),
            code_equal: Regex::new(
                r"pm\.expect\(\s*pm\.response\.(?:code|status)\s*\)\s*\.to\.(?:equal|eql)\(\s*(\d+)\s*\)",
            )
            .unwrap(),
            time_below: Regex::new(
                r"pm\.expect\(\s*pm\.response\.responseTime\s*\)\s*\.to\.be\.below\(\s*([\d.]+)\s*\)",
            )
            .unwrap(),
            header_have: Regex::new(
                r#"pm\.response\.to\.have\.header\(\s*(?:"([^"]+)"|'([^']+)')\s*\)"#,
            )
            .unwrap(),
            body_include: Regex::new(
                r#"pm\.expect\(\s*pm\.response\.text\(\)\s*\)\s*\.to\.include\(\s*(?:"([^"]*)"|'([^']*)')\s*\)"#,
            )
            .unwrap(),
            json_expect: Regex::new(
                r"pm\.expect\(\s*(?:pm\.response\.json\(\)|(\w+))\.([A-Za-z0-9_$.\[\]]+)\s*\)\s*\.to\.(exist|(?:equal|eql)\(\s*(.+?)\s*\))",
            )
            .unwrap(),
        }
    }

    /// Evaluate a test script against one request/response pair.
    pub fn execute_test(
        &self,
        script: &str,
        _request: &Request,
        response: &Response,
        _env: &Environment,
    ) -> ScriptResult {
        let aliases: Vec<String> = self
            .json_alias
            .captures_iter(script)
            .map(|c| c[1].to_string())
            .collect();

        let mut tests = Vec::new();
        for block_start in self.test_block.find_iter(script) {
            let open_paren = block_start.end() - 1;
            let Some(inner) = balanced_call_body(script, open_paren) else {
                return ScriptResult {
                    success: false,
                    tests,
                    error_message: "unbalanced parentheses in pm.test call".to_string(),
                };
            };

            let name = self
                .test_name
                .captures(inner)
                .and_then(|c| c.get(1).or_else(|| c.get(2)))
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "unnamed test".to_string());

            tests.push(self.evaluate_block(&name, inner, response, &aliases));
        }

        ScriptResult {
            success: true,
            tests,
            error_message: String::new(),
        }
    }

    /// Evaluate every recognised assertion in a block. The block passes
    /// when all of them do; a block with none passes vacuously (the
    /// sandbox executed it and nothing failed).
    fn evaluate_block(
        &self,
        name: &str,
        body: &str,
        response: &Response,
        aliases: &[String],
    ) -> TestResult {
        let mut failure = None;

        for captures in self.status_have.captures_iter(body) {
            let expected: u16 = captures[1].parse().unwrap_or(0);
            if response.status_code != expected && failure.is_none() {
                failure = Some(format!(
                    "expected status {expected}, got {}",
                    response.status_code
                ));
            }
        }

        for captures in self.code_equal.captures_iter(body) {
            let expected: u16 = captures[1].parse().unwrap_or(0);
            if response.status_code != expected && failure.is_none() {
                failure = Some(format!(
                    "expected status {expected}, got {}",
                    response.status_code
                ));
            }
        }

        for captures in self.time_below.captures_iter(body) {
            let threshold: f64 = captures[1].parse().unwrap_or(f64::MAX);
            if response.timing.total_ms >= threshold && failure.is_none() {
                failure = Some(format!(
                    "response time {:.1}ms not below {threshold}ms",
                    response.timing.total_ms
                ));
            }
        }

        for captures in self.header_have.captures_iter(body) {
            let header = captures
                .get(1)
                .or_else(|| captures.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            if !response.headers.contains_key(&header.to_lowercase()) && failure.is_none() {
                failure = Some(format!("header '{header}' not present"));
            }
        }

        for captures in self.body_include.captures_iter(body) {
            let needle = captures
                .get(1)
                .or_else(|| captures.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            if !response.text().contains(needle) && failure.is_none() {
                failure = Some(format!("body does not include '{needle}'"));
            }
        }

        for captures in self.json_expect.captures_iter(body) {
            // Either `pm.response.json().path` or a declared alias.
            if let Some(alias) = captures.get(1) {
                if !aliases.iter().any(|a| a == alias.as_str()) {
                    continue;
                }
            }
            let path = &captures[2];
            let expectation = &captures[3];
            if let Some(message) = self.check_json_path(response, path, expectation, captures.get(4))
            {
                if failure.is_none() {
                    failure = Some(message);
                }
            }
        }

        match failure {
            Some(message) => TestResult {
                name: name.to_string(),
                passed: false,
                error_message: message,
            },
            None => TestResult {
                name: name.to_string(),
                passed: true,
                error_message: String::new(),
            },
        }
    }

    /// Returns a failure message, or `None` when the expectation holds.
    fn check_json_path(
        &self,
        response: &Response,
        path: &str,
        expectation: &str,
        literal: Option<regex::Match<'_>>,
    ) -> Option<String> {
        let json: Value = match serde_json::from_str(&response.text()) {
            Ok(json) => json,
            Err(e) => return Some(format!("response body is not valid JSON: {e}")),
        };
        let json_path = match JsonPath::parse(&format!("$.{path}")) {
            Ok(p) => p,
            Err(e) => return Some(format!("invalid path '{path}': {e}")),
        };
        let node = json_path.query(&json).exactly_one().ok();

        if expectation == "exist" {
            return match node {
                Some(_) => None,
                None => Some(format!("'{path}' does not exist")),
            };
        }

        let Some(actual) = node else {
            return Some(format!("'{path}' does not exist"));
        };
        let expected = parse_literal(literal.map(|m| m.as_str()).unwrap_or_default());
        if json_value_equals(actual, &expected) {
            None
        } else {
            Some(format!(
                "'{path}' expected {expected}, got {actual}"
            ))
        }
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Contents of a call's parentheses, honouring nesting and string
/// literals. `open_paren` indexes the '(' itself.
fn balanced_call_body(script: &str, open_paren: usize) -> Option<&str> {
    let bytes = script.as_bytes();
    let mut depth = 0usize;
    let mut in_string: Option<u8> = None;
    let mut escaped = false;

    for (offset, &byte) in bytes[open_paren..].iter().enumerate() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == quote {
                in_string = None;
            }
            continue;
        }
        match byte {
            b'"' | b'\'' => in_string = Some(byte),
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&script[open_paren + 1..open_paren + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a JS-ish literal: JSON literals directly, single-quoted strings by
/// conversion, anything else as a bare string.
fn parse_literal(raw: &str) -> Value {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value;
    }
    if trimmed.len() >= 2 && trimmed.starts_with('\'') && trimmed.ends_with('\'') {
        return Value::String(trimmed[1..trimmed.len() - 1].to_string());
    }
    Value::String(trimmed.to_string())
}

fn json_value_equals(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    // Tolerate string/scalar representation differences, e.g. 200 vs "200".
    match (actual, expected) {
        (Value::String(s), other) | (other, Value::String(s)) => s == &other.to_string(),
        _ => false,
    }
}

/// Deferred validation of sampled responses against the run's test script.
pub fn validate_samples(context: &RunContext, store: &dyn RunStore, verbose: bool) {
    if context.test_script.is_empty() {
        return;
    }

    let samples = context.metrics().response_samples();
    if samples.is_empty() {
        if verbose {
            info!(run_id = %context.run_id, "no response samples collected for script validation");
        }
        return;
    }

    info!(
        run_id = %context.run_id,
        samples = samples.len(),
        "validating response samples with test script"
    );

    let timestamp = now_ms();
    let _ = store.add_metric(
        Metric::new(&context.run_id, timestamp, MetricName::TestsValidating, 1.0)
            .with_labels(format!(r#"{{"samples":{}}}"#, samples.len())),
    );
    let _ = store.add_metric(Metric::new(
        &context.run_id,
        timestamp,
        MetricName::TestsSampled,
        samples.len() as f64,
    ));

    // A dummy request rebuilt from the run's configuration gives scripts a
    // request object to look at; it never goes on the wire.
    let dummy_request = context
        .config
        .get("request")
        .and_then(|r| parse_request(r).ok())
        .unwrap_or_default();

    let engine = ScriptEngine::new();
    let env = Environment::new();
    let mut passed = 0usize;
    let mut failed = 0usize;
    let mut failure_messages: Vec<String> = Vec::new();

    for sample in &samples {
        let result =
            engine.execute_test(&context.test_script, &dummy_request, &sample.response, &env);

        if result.success {
            if result.tests.is_empty() {
                // Script ran but declared no tests: counts as one pass.
                passed += 1;
                continue;
            }
            for test in &result.tests {
                if test.passed {
                    passed += 1;
                } else {
                    failed += 1;
                    if failure_messages.len() < MAX_FAILURE_MESSAGES {
                        failure_messages.push(format!("{}: {}", test.name, test.error_message));
                    }
                }
            }
        } else {
            failed += 1;
            if failure_messages.len() < MAX_FAILURE_MESSAGES {
                failure_messages.push(format!("Script error: {}", result.error_message));
            }
        }
    }

    let timestamp = now_ms();
    let _ = store.add_metric(Metric::new(
        &context.run_id,
        timestamp,
        MetricName::TestsPassed,
        passed as f64,
    ));
    let _ = store.add_metric(Metric::new(
        &context.run_id,
        timestamp,
        MetricName::TestsFailed,
        failed as f64,
    ));

    if !failure_messages.is_empty() {
        let trace = serde_json::json!({
            "failures": failure_messages,
            "totalFailed": failed,
            "totalPassed": passed,
        });
        let row = ResultRow {
            run_id: context.run_id.clone(),
            timestamp_ms: timestamp,
            status_code: 0,
            latency_ms: 0.0,
            error: "Script validation failures".to_string(),
            trace_data: trace.to_string(),
        };
        if let Err(e) = store.add_result(row) {
            warn!(run_id = %context.run_id, error = %e, "failed to store validation failures");
        }
    }

    debug!(run_id = %context.run_id, passed, failed, "script validation finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timing;

    fn engine() -> ScriptEngine {
        ScriptEngine::new()
    }

    fn response(status: u16, body: &str) -> Response {
        let mut headers = crate::types::Headers::new();
        headers.insert("content-type".into(), "application/json".into());
        Response {
            status_code: status,
            status_text: crate::types::status_text(status).to_string(),
            headers,
            body: body.as_bytes().to_vec(),
            body_size: body.len(),
            timing: Timing {
                total_ms: 42.0,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_status_assertion_passes() {
        let script = r#"pm.test("Status is 200", function () {
            pm.response.to.have.status(200);
        });"#;
        let result = engine().execute_test(
            script,
            &Request::default(),
            &response(200, "{}"),
            &Environment::new(),
        );
        assert!(result.success);
        assert_eq!(result.tests.len(), 1);
        assert!(result.tests[0].passed);
        assert_eq!(result.tests[0].name, "Status is 200");
    }

    #[test]
    fn test_status_assertion_fails() {
        let script = r#"pm.test("Status is 200", function () {
            pm.response.to.have.status(200);
        });"#;
        let result = engine().execute_test(
            script,
            &Request::default(),
            &response(503, "{}"),
            &Environment::new(),
        );
        assert!(result.success);
        assert!(!result.tests[0].passed);
        assert!(result.tests[0].error_message.contains("503"));
    }

    #[test]
    fn test_expect_code_equal() {
        let script = r#"pm.test("ok", function () {
            pm.expect(pm.response.code).to.equal(201);
        });"#;
        let result = engine().execute_test(
            script,
            &Request::default(),
            &response(201, ""),
            &Environment::new(),
        );
        assert!(result.tests[0].passed);
    }

    #[test]
    fn test_response_time_below() {
        let script = r#"pm.test("fast", function () {
            pm.expect(pm.response.responseTime).to.be.below(100);
        });"#;
        let result = engine().execute_test(
            script,
            &Request::default(),
            &response(200, ""),
            &Environment::new(),
        );
        assert!(result.tests[0].passed);

        let script_slow = r#"pm.test("fast", function () {
            pm.expect(pm.response.responseTime).to.be.below(10);
        });"#;
        let result = engine().execute_test(
            script_slow,
            &Request::default(),
            &response(200, ""),
            &Environment::new(),
        );
        assert!(!result.tests[0].passed);
    }

    #[test]
    fn test_header_assertion() {
        let script = r#"pm.test("has content type", function () {
            pm.response.to.have.header("Content-Type");
        });"#;
        let result = engine().execute_test(
            script,
            &Request::default(),
            &response(200, "{}"),
            &Environment::new(),
        );
        assert!(result.tests[0].passed);
    }

    #[test]
    fn test_body_include() {
        let script = r#"pm.test("body has ok", function () {
            pm.expect(pm.response.text()).to.include("ok");
        });"#;
        let result = engine().execute_test(
            script,
            &Request::default(),
            &response(200, r#"{"ok": true}"#),
            &Environment::new(),
        );
        assert!(result.tests[0].passed);
    }

    #[test]
    fn test_json_path_equality_direct() {
        let script = r#"pm.test("ok flag", function () {
            pm.expect(pm.response.json().ok).to.equal(true);
        });"#;
        let result = engine().execute_test(
            script,
            &Request::default(),
            &response(200, r#"{"ok": true}"#),
            &Environment::new(),
        );
        assert!(result.tests[0].passed, "{:?}", result.tests[0]);
    }

    #[test]
    fn test_json_path_via_alias() {
        let script = r#"
        pm.test("user id", function () {
            var data = pm.response.json();
            pm.expect(data.user.id).to.equal("u-1");
        });"#;
        let result = engine().execute_test(
            script,
            &Request::default(),
            &response(200, r#"{"user": {"id": "u-1"}}"#),
            &Environment::new(),
        );
        assert!(result.tests[0].passed, "{:?}", result.tests[0]);
    }

    #[test]
    fn test_json_path_exist() {
        let script = r#"pm.test("has token", function () {
            pm.expect(pm.response.json().token).to.exist;
        });"#;
        let passing = engine().execute_test(
            script,
            &Request::default(),
            &response(200, r#"{"token": "abc"}"#),
            &Environment::new(),
        );
        assert!(passing.tests[0].passed);

        let failing = engine().execute_test(
            script,
            &Request::default(),
            &response(200, r#"{}"#),
            &Environment::new(),
        );
        assert!(!failing.tests[0].passed);
    }

    #[test]
    fn test_multiple_blocks_counted_independently() {
        let script = r#"
        pm.test("status", function () { pm.response.to.have.status(200); });
        pm.test("body", function () { pm.expect(pm.response.text()).to.include("nope"); });
        "#;
        let result = engine().execute_test(
            script,
            &Request::default(),
            &response(200, "yes"),
            &Environment::new(),
        );
        assert_eq!(result.tests.len(), 2);
        assert!(result.tests[0].passed);
        assert!(!result.tests[1].passed);
    }

    #[test]
    fn test_no_test_blocks_yields_empty_list() {
        let result = engine().execute_test(
            "console.log('hello');",
            &Request::default(),
            &response(200, ""),
            &Environment::new(),
        );
        assert!(result.success);
        assert!(result.tests.is_empty());
    }

    #[test]
    fn test_unbalanced_script_is_script_error() {
        let result = engine().execute_test(
            r#"pm.test("broken", function () { pm.response.to.have.status(200);"#,
            &Request::default(),
            &response(200, ""),
            &Environment::new(),
        );
        assert!(!result.success);
        assert!(!result.error_message.is_empty());
    }

    #[test]
    fn test_block_without_recognised_assertions_passes() {
        let script = r#"pm.test("custom logic", function () {
            var x = 1 + 1;
        });"#;
        let result = engine().execute_test(
            script,
            &Request::default(),
            &response(200, ""),
            &Environment::new(),
        );
        assert!(result.tests[0].passed);
    }

    #[test]
    fn test_invalid_json_body_fails_json_assertion() {
        let script = r#"pm.test("json", function () {
            pm.expect(pm.response.json().a).to.equal(1);
        });"#;
        let result = engine().execute_test(
            script,
            &Request::default(),
            &response(200, "not json"),
            &Environment::new(),
        );
        assert!(!result.tests[0].passed);
        assert!(result.tests[0].error_message.contains("not valid JSON"));
    }
}
