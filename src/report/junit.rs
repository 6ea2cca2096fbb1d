//! JUnit XML output for CI integration.
//!
//! Each QAID becomes one `<testcase>`; failing QAIDs carry a `<failure>`
//! element with the first failing assertion's message and output excerpt,
//! aborted QAIDs an `<error>` element.

use std::io::Cursor;
use std::path::Path;

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use tracing::info;

use super::{QaidReport, QaidStatus, RunSummary};

/// Writes the run's JUnit XML report to `output_path`.
pub fn write_junit(
    output_path: &Path,
    reports: &[QaidReport],
    summary: &RunSummary,
) -> std::io::Result<()> {
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let xml = render(reports, summary).map_err(std::io::Error::other)?;
    std::fs::write(output_path, xml)?;
    info!("wrote JUnit XML to {}", output_path.display());
    Ok(())
}

fn render(reports: &[QaidReport], summary: &RunSummary) -> quick_xml::Result<String> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let failures = summary.failed.to_string();
    let errors = summary.aborted.to_string();
    let tests = summary.total_qaids.to_string();
    let time = format!("{:.3}", summary.duration.as_secs_f64());

    let mut suites = BytesStart::new("testsuites");
    suites.push_attribute(("tests", tests.as_str()));
    suites.push_attribute(("failures", failures.as_str()));
    suites.push_attribute(("errors", errors.as_str()));
    suites.push_attribute(("time", time.as_str()));
    writer.write_event(Event::Start(suites))?;

    let mut suite = BytesStart::new("testsuite");
    suite.push_attribute(("name", "fosrun"));
    suite.push_attribute(("tests", tests.as_str()));
    suite.push_attribute(("failures", failures.as_str()));
    suite.push_attribute(("errors", errors.as_str()));
    suite.push_attribute(("timestamp", chrono::Utc::now().to_rfc3339().as_str()));
    writer.write_event(Event::Start(suite))?;

    for report in reports {
        let mut testcase = BytesStart::new("testcase");
        testcase.push_attribute(("name", report.qaid.as_str()));
        testcase.push_attribute(("classname", "fos"));

        match report.status {
            QaidStatus::Pass => {
                writer.write_event(Event::Empty(testcase))?;
            }
            QaidStatus::Fail => {
                writer.write_event(Event::Start(testcase))?;
                let first_fail = report.details.iter().find(|r| !r.passed);
                let message = first_fail
                    .map(|r| format!("line {}: {}", r.op_line, r.message))
                    .unwrap_or_else(|| "assertion failed".to_string());

                let mut failure = BytesStart::new("failure");
                failure.push_attribute(("message", message.as_str()));
                writer.write_event(Event::Start(failure))?;
                if let Some(record) = first_fail
                    && !record.output_excerpt.is_empty()
                {
                    writer.write_event(Event::Text(BytesText::new(&record.output_excerpt)))?;
                }
                writer.write_event(Event::End(BytesEnd::new("failure")))?;
                writer.write_event(Event::End(BytesEnd::new("testcase")))?;
            }
            QaidStatus::Aborted => {
                writer.write_event(Event::Start(testcase))?;
                let mut error = BytesStart::new("error");
                error.push_attribute(("message", "run aborted"));
                writer.write_event(Event::Empty(error))?;
                writer.write_event(Event::End(BytesEnd::new("testcase")))?;
            }
        }
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

    let bytes = writer.into_inner().into_inner();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
