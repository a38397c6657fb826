use colored::*;

use crate::executor::RunReport;
use crate::metrics::{
    HTTP_REQS, HTTP_REQ_DURATION, HTTP_REQ_FAILED, ITERATIONS, ITERATIONS_ABORTED,
};
use crate::models::metrics::MetricSummary;

/// Prints the end-of-run report to stdout.
pub fn print_summary(report: &RunReport) {
    println!();
    println!("{}", " 🔥 ======== TEST RESULTS ======== 🔥 ".bold().white().on_blue());
    line("⏰ Timestamp", &report.timestamp);
    line("🎯 Target", &report.target);
    line("⏱️  Duration (s)", &format!("{:.2}", report.duration_secs));
    line("👥 Peak virtual users", &report.ramp.peak_active.to_string());
    line("🖥️  CPU cores", &report.host.cpu_cores.to_string());

    if let Some(MetricSummary::Counter { count }) = report.metrics.get(HTTP_REQS) {
        line("✅ Total requests", &count.to_string());
        if report.duration_secs > 0.0 {
            line(
                "📈 Requests per second",
                &format!("{:.2}", *count as f64 / report.duration_secs),
            );
        }
    }
    if let Some(MetricSummary::Rate { rate, fails, .. }) = report.metrics.get(HTTP_REQ_FAILED) {
        line("❌ Failed requests", &format!("{} ({:.2}%)", fails, rate * 100.0));
    }
    if let Some(MetricSummary::Trend { min, med, p95, max, .. }) = report.metrics.get(HTTP_REQ_DURATION) {
        line("⚡ Fastest response (ms)", &format!("{:.2}", min));
        line("📊 Median response (ms)", &format!("{:.2}", med));
        line("📊 p(95) response (ms)", &format!("{:.2}", p95));
        line("🐢 Slowest response (ms)", &format!("{:.2}", max));
    }
    for (label, name) in [("🔁 Iterations", ITERATIONS), ("💥 Aborted iterations", ITERATIONS_ABORTED)] {
        if let Some(MetricSummary::Counter { count }) = report.metrics.get(name) {
            line(label, &count.to_string());
        }
    }

    println!();
    println!("{}", " 📦 ======== METRICS ======== ".bold().white().on_blue());
    for (name, summary) in &report.metrics {
        let value = match summary {
            MetricSummary::Counter { count } => count.to_string(),
            MetricSummary::Rate { rate, passes, fails } => {
                format!("{:.2}%  ✓ {}  ✗ {}", rate * 100.0, passes, fails)
            }
            MetricSummary::Trend { count, avg, med, p90, p95, max, .. } => format!(
                "avg={:.2}ms med={:.2}ms p(90)={:.2}ms p(95)={:.2}ms max={:.2}ms n={}",
                avg, med, p90, p95, max, count
            ),
        };
        println!("{} {}", format!("• {}:", name).bold(), value);
    }

    if !report.thresholds.results.is_empty() {
        println!();
        println!("{}", " 🚦 ======== THRESHOLDS ======== ".bold().white().on_blue());
        for result in &report.thresholds.results {
            let mark = if result.passed { "✓".green().bold() } else { "✗".red().bold() };
            println!(
                "{} {} {} {}",
                mark,
                result.metric.bold(),
                result.expression,
                format!("(observed {:.4})", result.observed).dimmed()
            );
        }
    }

    println!();
    if report.passed() {
        println!("{}", " PASS ".bold().black().on_green());
    } else {
        println!("{}", " FAIL ".bold().white().on_red());
    }
}

fn line(label: &str, value: &str) {
    println!("{} {}", format!("{:<26}:", label).bold().cyan(), value.bold());
}
