//! Report plugins: turn executed tests into external artifacts.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::test::{Test, TestScope};

/// Context of the run a report describes.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub hosts: Vec<String>,
    pub platforms: Vec<String>,
}

/// Consumes the full set of executed tests plus run context and produces an
/// external artifact. Must not mutate test state.
pub trait ReportPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn report(&self, ctx: &RunContext, tests: &[Test]) -> anyhow::Result<()>;
}

/// Built-in console report.
#[derive(Debug, Default)]
pub struct StdoutReport;

impl StdoutReport {
    fn scope_label(scope: &TestScope) -> String {
        match scope {
            TestScope::Global => "global".to_string(),
            TestScope::Platform(p) => format!("platform {p}"),
            TestScope::Host { host, .. } => format!("host {host}"),
        }
    }
}

impl ReportPlugin for StdoutReport {
    fn name(&self) -> &str {
        "stdout"
    }

    fn report(&self, ctx: &RunContext, tests: &[Test]) -> anyhow::Result<()> {
        println!(
            "===== Test report: {} tests over {} hosts / {} platforms =====",
            tests.len(),
            ctx.hosts.len(),
            ctx.platforms.len()
        );
        let mut failures = 0usize;
        for test in tests {
            let status = if test.passed() { "PASS" } else { "FAIL" };
            println!(
                "[{status}] {} ({})",
                test.name(),
                Self::scope_label(test.scope())
            );
            for error in test.errors() {
                failures += 1;
                for (idx, line) in error.lines().enumerate() {
                    if idx == 0 {
                        println!("    - {line}");
                    } else {
                        println!("      {line}");
                    }
                }
            }
        }
        if failures == 0 {
            println!("===== No errors =====");
        } else {
            println!("===== {failures} error(s) were found. Check output. =====");
        }
        Ok(())
    }
}

// ── test_report.json schema ──────────────────────────────────────────────

/// Per-test entry of the JSON artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestOutcome {
    pub name: String,
    pub platform: Option<String>,
    pub host: Option<String>,
    pub executed: bool,
    pub errors: Vec<String>,
}

/// Machine-readable run artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestReportArtifact {
    pub run_at: DateTime<Utc>,
    pub hosts: Vec<String>,
    pub platforms: Vec<String>,
    pub outcomes: Vec<TestOutcome>,
    pub total: usize,
    pub failed: usize,
}

/// Built-in JSON file report.
#[derive(Debug)]
pub struct JsonReport {
    pub path: PathBuf,
}

impl Default for JsonReport {
    fn default() -> Self {
        Self {
            path: PathBuf::from("test_report.json"),
        }
    }
}

impl ReportPlugin for JsonReport {
    fn name(&self) -> &str {
        "json"
    }

    fn report(&self, ctx: &RunContext, tests: &[Test]) -> anyhow::Result<()> {
        let outcomes: Vec<TestOutcome> = tests
            .iter()
            .map(|test| {
                let (platform, host) = match test.scope() {
                    TestScope::Global => (None, None),
                    TestScope::Platform(p) => (Some(p.clone()), None),
                    TestScope::Host { platform, host } => {
                        (Some(platform.clone()), Some(host.clone()))
                    }
                };
                TestOutcome {
                    name: test.name().to_string(),
                    platform,
                    host,
                    executed: test.executed(),
                    errors: test.errors().to_vec(),
                }
            })
            .collect();

        let artifact = TestReportArtifact {
            run_at: Utc::now(),
            hosts: ctx.hosts.clone(),
            platforms: ctx.platforms.clone(),
            total: outcomes.len(),
            failed: outcomes.iter().filter(|o| !o.errors.is_empty()).count(),
            outcomes,
        };
        std::fs::write(&self.path, serde_json::to_string_pretty(&artifact)?)?;
        Ok(())
    }
}
