use anyhow::{Context, Result};
use tracing::info;

use super::Project;
use crate::index::field_cache::FieldIndex;

/// Empty the symbol cache and, with `fields`, the field index too.
pub async fn clear_cache(project: String, fields: bool) -> Result<()> {
    let project = Project::open(&project)?;
    let options = project.refresh_options();

    let mut store = project.open_store();
    let objects = store.objects().len();
    store.clear().context("Failed to clear symbol cache")?;
    info!("Cleared {} objects from {}", objects, options.cache_dir.display());
    println!("Cleared {} objects", objects);

    if fields {
        FieldIndex::default()
            .save(&options.cache_dir)
            .context("Failed to clear field index")?;
        println!("Cleared field index");
    }
    Ok(())
}
