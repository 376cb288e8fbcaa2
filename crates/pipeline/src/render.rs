use std::fmt::Write;
use std::time::Duration;

use crate::report::{PipelineReport, StageStatus};

/// `1h 02m 03s`, `4m 05s`, `6s`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

fn mark(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Succeed => "✔",
        StageStatus::Failed => "✘",
        StageStatus::Pending => "…",
        StageStatus::Queued => "-",
    }
}

/// Human-readable summary sent to notifiers.
pub fn render_report(report: &PipelineReport) -> String {
    let mut out = String::new();
    let title = report.title.clone().unwrap_or_else(|| {
        if report.is_successful() {
            format!("{} build succeeded", report.project_id)
        } else {
            format!("{} build failed", report.project_id)
        }
    });
    let _ = writeln!(out, "{title}");
    let _ = writeln!(
        out,
        "Project: {} ({})  Version: {}",
        report.project_id,
        report.branch,
        report.version.as_deref().unwrap_or("unchanged")
    );
    if let Some(message) = &report.message {
        let _ = writeln!(out, "{message}");
    }

    let _ = writeln!(out, "\nTargets:");
    for (name, target) in &report.targets {
        let _ = write!(out, "  {} {name}: {}", mark(target.status), target.status);
        if let Some(elapsed) = target.elapsed {
            let _ = write!(out, " in {}", format_duration(elapsed));
        }
        if let Some(runner) = &target.runner {
            let _ = write!(out, " on {runner}");
        }
        if let Some(message) = &target.message
            && let Some(first) = message.lines().next()
        {
            let _ = write!(out, " ({first})");
        }
        out.push('\n');
    }

    if !report.deploys.is_empty() {
        let _ = writeln!(out, "\nDeploys:");
        for deploy in &report.deploys {
            let _ = write!(
                out,
                "  {} {} [{}] {}",
                mark(deploy.status),
                deploy.deployer,
                deploy.tier,
                deploy.target
            );
            if let Some(message) = &deploy.message {
                let _ = write!(out, " ({message})");
            }
            out.push('\n');
        }
    }

    if !report.change_log.is_empty() {
        let _ = writeln!(out, "\nChanges:");
        for line in &report.change_log {
            let _ = writeln!(out, "  • {line}");
        }
    }

    if let Some(elapsed) = report.elapsed {
        let _ = writeln!(out, "\nTotal: {}", format_duration(elapsed));
    }
    out
}
