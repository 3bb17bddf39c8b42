use anyhow::Result;

use super::Project;

/// Rescan extracted sources and print the table/page counts.
pub async fn update_fields(project: String, app: Option<String>) -> Result<()> {
    let project = Project::open(&project)?;
    let coordinator = project.coordinator()?;

    let result = coordinator.update_field_cache(app.as_deref()).await;
    coordinator.shutdown().await;
    let index = result?;

    println!(
        "Field index: {} tables, {} pages, {} source files",
        index.table_fields.len(),
        index.page_sources.len(),
        index.watermarks.len()
    );
    Ok(())
}
