use std::sync::Arc;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use super::Project;
use crate::refresh::{ArtifactState, RefreshEvent, RefreshOutcome};

pub async fn refresh_project(project: String, quiet: bool) -> Result<()> {
    let project = Project::open(&project)?;
    info!("Refreshing symbol cache for {}", project.dir.display());

    let pb = ProgressBar::hidden();
    if !quiet {
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    }
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>4}/{len:4} packages {msg}")?
            .progress_chars("##-"),
    );

    let bar = pb.clone();
    let coordinator = project
        .coordinator()?
        .with_event_callback(Arc::new(move |event: RefreshEvent| render_event(&bar, event)));

    let outcome = coordinator.refresh().await;
    coordinator.shutdown().await;
    pb.finish_and_clear();

    let report = match outcome {
        RefreshOutcome::Completed(report) => report,
        RefreshOutcome::AlreadyRunning => {
            println!("A refresh is already running");
            return Ok(());
        }
    };

    println!(
        "Refreshed {} packages in {:.1}s: {} succeeded, {} skipped, {} failed",
        report.artifacts.len(),
        report.duration.as_secs_f64(),
        report.count(ArtifactState::Succeeded),
        report.count(ArtifactState::Skipped),
        report.count(ArtifactState::Failed)
    );
    println!(
        "Cache holds {} objects and {} procedures",
        report.object_count, report.procedure_count
    );
    for failed in report.errors() {
        let label = if failed.benign { "skipped (not a package)" } else { "failed" };
        println!(
            "  {} {}: {}",
            failed.artifact.file_name(),
            label,
            failed.error.as_deref().unwrap_or("unknown error")
        );
    }

    let hard_failures = report.errors().filter(|a| !a.benign).count();
    if hard_failures > 0 {
        anyhow::bail!("{} packages failed to refresh", hard_failures);
    }
    Ok(())
}

fn render_event(pb: &ProgressBar, event: RefreshEvent) {
    match event {
        RefreshEvent::Started { total } => pb.set_length(total as u64),
        RefreshEvent::StateChanged { artifact, state } => {
            let name = artifact
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if state.is_terminal() {
                pb.inc(1);
            }
            pb.set_message(format!("{} {}", state, name));
        }
        RefreshEvent::Warning { message, .. } => pb.println(format!("warning: {}", message)),
        RefreshEvent::Error { message, benign, .. } => {
            let prefix = if benign { "note" } else { "error" };
            pb.println(format!("{}: {}", prefix, message));
        }
        RefreshEvent::Committed { objects, .. } => pb.set_message(format!("committed {} objects", objects)),
        RefreshEvent::Progress { .. } | RefreshEvent::AlreadyRunning => {}
    }
}
