//! Per-QAID result tracking and reporting.
//!
//! The [`ResultManager`] collects assertion records as the executor runs,
//! computes each QAID's final status (the AND of its records), and streams
//! events to [`ResultSink`]s. Sink failures are logged and never halt
//! execution.

pub mod junit;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use junit::write_junit;

/// Final status of a QAID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QaidStatus {
    Pass,
    Fail,
    /// The run was cancelled while this QAID still had unfinalized records.
    Aborted,
}

impl std::fmt::Display for QaidStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QaidStatus::Pass => write!(f, "pass"),
            QaidStatus::Fail => write!(f, "fail"),
            QaidStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// One assertion outcome attributed to a QAID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionRecord {
    pub passed: bool,
    pub message: String,
    pub op_line: u32,
    pub device: String,
    pub output_excerpt: String,
}

/// A QAID's final report: status plus the contributing assertions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaidReport {
    pub qaid: String,
    pub status: QaidStatus,
    pub details: Vec<AssertionRecord>,
}

/// A classified CLI/guest error, optionally attributed to a QAID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandErrorRecord {
    pub qaid: Option<String>,
    pub line: u32,
    pub command: String,
    pub output_excerpt: String,
}

/// Aggregate counts for one run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub total_qaids: usize,
    pub passed: usize,
    pub failed: usize,
    pub aborted: usize,
    pub command_errors: usize,
    pub duration: Duration,
}

impl RunSummary {
    /// Whether the run succeeded: every QAID passed and no classified
    /// errors were recorded.
    pub fn success(&self) -> bool {
        self.failed == 0 && self.aborted == 0 && self.command_errors == 0
    }

    /// Host CLI exit code: 0 all-pass, 1 any failure.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Receives result events during execution.
///
/// Implementations persist to logs, dashboards, or upstream test systems.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Called for every assertion record as it is appended.
    async fn add_record(&self, qaid: &str, record: &AssertionRecord);

    /// Called once per QAID when its final status is computed.
    async fn finalize(&self, report: &QaidReport);
}

/// A sink that does nothing (for tests or when output is not needed).
pub struct NullSink;

#[async_trait]
impl ResultSink for NullSink {
    async fn add_record(&self, _qaid: &str, _record: &AssertionRecord) {}
    async fn finalize(&self, _report: &QaidReport) {}
}

/// A sink that fans out to multiple sinks.
pub struct MultiSink {
    sinks: Vec<Box<dyn ResultSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn with_sink<S: ResultSink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl Default for MultiSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultSink for MultiSink {
    async fn add_record(&self, qaid: &str, record: &AssertionRecord) {
        for sink in &self.sinks {
            sink.add_record(qaid, record).await;
        }
    }

    async fn finalize(&self, report: &QaidReport) {
        for sink in &self.sinks {
            sink.finalize(report).await;
        }
    }
}

/// Console sink showing assertion and QAID outcomes in the terminal.
pub struct ConsoleSink {
    verbose: bool,
}

impl ConsoleSink {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

#[async_trait]
impl ResultSink for ConsoleSink {
    async fn add_record(&self, qaid: &str, record: &AssertionRecord) {
        if self.verbose || !record.passed {
            let status = if record.passed {
                console::style("ok  ").green()
            } else {
                console::style("FAIL").red()
            };
            println!(
                "{} [{}] line {}: {}",
                status, qaid, record.op_line, record.message
            );
        }
    }

    async fn finalize(&self, report: &QaidReport) {
        let status = match report.status {
            QaidStatus::Pass => console::style("PASS").green().bold(),
            QaidStatus::Fail => console::style("FAIL").red().bold(),
            QaidStatus::Aborted => console::style("ABRT").yellow().bold(),
        };
        println!(
            "{} {} ({} assertions)",
            status,
            report.qaid,
            report.details.len()
        );
    }
}

/// Per-run outcome tracking.
///
/// Records append in executor order per QAID. Finalization order is
/// preserved: `get_report` lists finalized QAIDs first, in the order
/// `report` ops finalized them, then never-finalized QAIDs in
/// first-appearance order.
pub struct ResultManager {
    records: HashMap<String, Vec<AssertionRecord>>,
    /// First-appearance order of QAIDs.
    qaid_order: Vec<String>,
    /// Finalization order and statuses.
    finalized: Vec<(String, QaidStatus)>,
    finalized_set: HashSet<String>,
    command_errors: Vec<CommandErrorRecord>,
    sinks: Vec<Box<dyn ResultSink>>,
}

impl ResultManager {
    pub fn new(sinks: Vec<Box<dyn ResultSink>>) -> Self {
        Self {
            records: HashMap::new(),
            qaid_order: Vec::new(),
            finalized: Vec::new(),
            finalized_set: HashSet::new(),
            command_errors: Vec::new(),
            sinks,
        }
    }

    async fn append(&mut self, qaid: &str, record: AssertionRecord) {
        if !self.qaid_order.iter().any(|q| q == qaid) {
            self.qaid_order.push(qaid.to_string());
        }
        for sink in &self.sinks {
            sink.add_record(qaid, &record).await;
        }
        self.records.entry(qaid.to_string()).or_default().push(record);
    }

    /// Records an `expect` outcome.
    pub async fn add_expect(
        &mut self,
        qaid: &str,
        passed: bool,
        rule: &str,
        output: &str,
        op_line: u32,
        device: &str,
    ) {
        self.append(
            qaid,
            AssertionRecord {
                passed,
                message: rule.to_string(),
                op_line,
                device: device.to_string(),
                output_excerpt: excerpt(output),
            },
        )
        .await;
    }

    /// Records a `check_var` outcome. Without a QAID the record lands in
    /// the unattributed error list when it failed, and is dropped when it
    /// passed.
    pub async fn add_check_var(
        &mut self,
        qaid: Option<&str>,
        passed: bool,
        message: &str,
        op_line: u32,
        device: &str,
    ) {
        match qaid {
            Some(qaid) => {
                self.append(
                    qaid,
                    AssertionRecord {
                        passed,
                        message: message.to_string(),
                        op_line,
                        device: device.to_string(),
                        output_excerpt: String::new(),
                    },
                )
                .await;
            }
            None if !passed => self.command_errors.push(CommandErrorRecord {
                qaid: None,
                line: op_line,
                command: message.to_string(),
                output_excerpt: String::new(),
            }),
            None => {}
        }
    }

    /// Records a direct `report` assertion.
    pub async fn add_report(
        &mut self,
        qaid: &str,
        passed: bool,
        message: &str,
        op_line: u32,
        device: &str,
    ) {
        self.append(
            qaid,
            AssertionRecord {
                passed,
                message: message.to_string(),
                op_line,
                device: device.to_string(),
                output_excerpt: String::new(),
            },
        )
        .await;
    }

    /// Records a classified CLI error. Always recorded; QAID attribution
    /// is optional.
    pub async fn add_command_error(
        &mut self,
        qaid: Option<&str>,
        line: u32,
        command: &str,
        output: &str,
    ) {
        if let Some(qaid) = qaid {
            self.append(
                qaid,
                AssertionRecord {
                    passed: false,
                    message: format!("CLI error running '{command}'"),
                    op_line: line,
                    device: String::new(),
                    output_excerpt: excerpt(output),
                },
            )
            .await;
        }
        self.command_errors.push(CommandErrorRecord {
            qaid: qaid.map(str::to_string),
            line,
            command: command.to_string(),
            output_excerpt: excerpt(output),
        });
    }

    /// Records a guest-code failure (`exec_code` or a plugin API).
    pub async fn add_guest_error(&mut self, line: u32, what: &str, detail: &str) {
        self.command_errors.push(CommandErrorRecord {
            qaid: None,
            line,
            command: what.to_string(),
            output_excerpt: excerpt(detail),
        });
    }

    /// Finalizes a QAID: its status is the AND of all recorded assertions.
    /// Triggered by the `report` API; repeated finalization is ignored.
    pub async fn finalize(&mut self, qaid: &str) {
        if self.finalized_set.contains(qaid) {
            warn!("QAID '{qaid}' was already finalized; ignoring repeat");
            return;
        }
        let details = self.records.get(qaid).cloned().unwrap_or_default();
        let status = if details.iter().all(|r| r.passed) {
            QaidStatus::Pass
        } else {
            QaidStatus::Fail
        };
        self.finalized_set.insert(qaid.to_string());
        self.finalized.push((qaid.to_string(), status));

        let report = QaidReport {
            qaid: qaid.to_string(),
            status,
            details,
        };
        for sink in &self.sinks {
            sink.finalize(&report).await;
        }
    }

    /// Marks every in-flight (unfinalized) QAID as aborted. Called when a
    /// run is cancelled.
    pub async fn finalize_aborted(&mut self) {
        let pending: Vec<String> = self
            .qaid_order
            .iter()
            .filter(|q| !self.finalized_set.contains(*q))
            .cloned()
            .collect();
        for qaid in pending {
            self.finalized_set.insert(qaid.clone());
            self.finalized.push((qaid.clone(), QaidStatus::Aborted));
            let report = QaidReport {
                qaid: qaid.clone(),
                status: QaidStatus::Aborted,
                details: self.records.get(&qaid).cloned().unwrap_or_default(),
            };
            for sink in &self.sinks {
                sink.finalize(&report).await;
            }
        }
    }

    /// Number of assertion records for a QAID.
    pub fn record_count(&self, qaid: &str) -> usize {
        self.records.get(qaid).map(Vec::len).unwrap_or(0)
    }

    pub fn command_errors(&self) -> &[CommandErrorRecord] {
        &self.command_errors
    }

    /// Final per-QAID reports: finalized first (finalization order), then
    /// the rest (first-appearance order) with computed statuses.
    pub fn get_report(&self) -> Vec<QaidReport> {
        let mut out = Vec::new();
        for (qaid, status) in &self.finalized {
            out.push(QaidReport {
                qaid: qaid.clone(),
                status: *status,
                details: self.records.get(qaid).cloned().unwrap_or_default(),
            });
        }
        for qaid in &self.qaid_order {
            if self.finalized_set.contains(qaid) {
                continue;
            }
            let details = self.records.get(qaid).cloned().unwrap_or_default();
            let status = if details.iter().all(|r| r.passed) {
                QaidStatus::Pass
            } else {
                QaidStatus::Fail
            };
            out.push(QaidReport {
                qaid: qaid.clone(),
                status,
                details,
            });
        }
        out
    }

    /// Aggregate counts over the final report.
    pub fn summary(&self, duration: Duration) -> RunSummary {
        let reports = self.get_report();
        RunSummary {
            total_qaids: reports.len(),
            passed: reports
                .iter()
                .filter(|r| r.status == QaidStatus::Pass)
                .count(),
            failed: reports
                .iter()
                .filter(|r| r.status == QaidStatus::Fail)
                .count(),
            aborted: reports
                .iter()
                .filter(|r| r.status == QaidStatus::Aborted)
                .count(),
            command_errors: self.command_errors.len(),
            duration,
        }
    }
}

/// Trims device output to a diagnosable excerpt.
fn excerpt(output: &str) -> String {
    const MAX: usize = 400;
    if output.len() <= MAX {
        output.to_string()
    } else {
        let mut cut = MAX;
        while !output.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &output[..cut])
    }
}

/// Prints the end-of-run summary to the console.
pub fn print_summary(reports: &[QaidReport], summary: &RunSummary) {
    println!();
    println!("QAID results:");
    for report in reports {
        let status = match report.status {
            QaidStatus::Pass => console::style("pass").green(),
            QaidStatus::Fail => console::style("fail").red(),
            QaidStatus::Aborted => console::style("aborted").yellow(),
        };
        println!(
            "  {:<12} {} ({} assertions)",
            report.qaid,
            status,
            report.details.len()
        );
    }
    println!();
    println!("  Total:   {}", summary.total_qaids);
    println!("  Passed:  {}", console::style(summary.passed).green());
    println!("  Failed:  {}", console::style(summary.failed).red());
    if summary.aborted > 0 {
        println!("  Aborted: {}", console::style(summary.aborted).yellow());
    }
    if summary.command_errors > 0 {
        println!(
            "  Errors:  {}",
            console::style(summary.command_errors).red().bold()
        );
    }
    println!("  Duration: {:?}", summary.duration);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ResultManager {
        ResultManager::new(vec![Box::new(NullSink)])
    }

    #[tokio::test]
    async fn test_records_append_in_order() {
        let mut m = manager();
        m.add_expect("QA1", true, "expect 'login:'", "login: ", 3, "FGT1")
            .await;
        m.add_check_var(Some("QA1"), false, "ip == 10.0.0.1", 4, "FGT1")
            .await;

        assert_eq!(m.record_count("QA1"), 2);
        let report = &m.get_report()[0];
        assert!(report.details[0].passed);
        assert!(!report.details[1].passed);
    }

    #[tokio::test]
    async fn test_finalize_is_and_of_records() {
        let mut m = manager();
        m.add_expect("QA1", true, "a", "", 1, "FGT1").await;
        m.add_expect("QA1", true, "b", "", 2, "FGT1").await;
        m.finalize("QA1").await;

        m.add_expect("QA2", true, "a", "", 3, "FGT1").await;
        m.add_expect("QA2", false, "b", "", 4, "FGT1").await;
        m.finalize("QA2").await;

        let reports = m.get_report();
        assert_eq!(reports[0].status, QaidStatus::Pass);
        assert_eq!(reports[1].status, QaidStatus::Fail);
    }

    #[tokio::test]
    async fn test_finalized_order_comes_first() {
        let mut m = manager();
        m.add_expect("QA_LATE", true, "a", "", 1, "d").await;
        m.add_expect("QA_FIRST", true, "b", "", 2, "d").await;
        m.finalize("QA_FIRST").await;

        let reports = m.get_report();
        assert_eq!(reports[0].qaid, "QA_FIRST");
        assert_eq!(reports[1].qaid, "QA_LATE");
    }

    #[tokio::test]
    async fn test_repeat_finalize_is_ignored() {
        let mut m = manager();
        m.add_expect("QA1", true, "a", "", 1, "d").await;
        m.finalize("QA1").await;
        m.add_expect("QA1", false, "late", "", 2, "d").await;
        m.finalize("QA1").await;

        let reports = m.get_report();
        assert_eq!(reports.len(), 1);
        // The first finalization stands.
        assert_eq!(reports[0].status, QaidStatus::Pass);
    }

    #[tokio::test]
    async fn test_aborted_marker_for_in_flight_qaids() {
        let mut m = manager();
        m.add_expect("QA_DONE", true, "a", "", 1, "d").await;
        m.finalize("QA_DONE").await;
        m.add_expect("QA_PENDING", true, "b", "", 2, "d").await;
        m.finalize_aborted().await;

        let reports = m.get_report();
        assert_eq!(reports[0].status, QaidStatus::Pass);
        assert_eq!(reports[1].status, QaidStatus::Aborted);
    }

    #[tokio::test]
    async fn test_command_errors_fail_the_run() {
        let mut m = manager();
        m.add_command_error(None, 7, "get bogus", "Unknown action 0").await;
        let summary = m.summary(Duration::ZERO);
        assert_eq!(summary.command_errors, 1);
        assert!(!summary.success());
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_attributed_command_error_fails_the_qaid() {
        let mut m = manager();
        m.add_command_error(Some("QA9"), 7, "get bogus", "Command fail.")
            .await;
        let reports = m.get_report();
        assert_eq!(reports[0].qaid, "QA9");
        assert_eq!(reports[0].status, QaidStatus::Fail);
    }

    #[tokio::test]
    async fn test_empty_run_summary_passes() {
        let m = manager();
        let summary = m.summary(Duration::ZERO);
        assert_eq!(summary.total_qaids, 0);
        assert!(summary.success());
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn test_excerpt_truncates() {
        let long = "x".repeat(1000);
        let cut = excerpt(&long);
        assert!(cut.len() < 500);
        assert!(cut.ends_with("..."));
    }
}
