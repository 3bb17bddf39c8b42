use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::indexer::legacy::{parse_legacy_object, IdRange};

/// Keep only fields, controls and actions inside `ranges` and print the result,
/// either as C/AL text or as the parsed structure in JSON.
pub fn filter_object(file: PathBuf, ranges: Vec<IdRange>, format: String, output: Option<PathBuf>) -> Result<()> {
    let bytes = std::fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    let mut object = parse_legacy_object(text.trim_start_matches('\u{feff}'))
        .with_context(|| format!("{} is not a C/AL object export", file.display()))?;

    for section in &object.malformed_sections {
        eprintln!("warning: {} section has unbalanced braces and was kept verbatim", section);
    }
    if !ranges.is_empty() {
        object.filter_by_id_ranges(&ranges);
    }

    let rendered = match format.as_str() {
        "text" => object.reconstruct(),
        "json" => serde_json::to_string_pretty(&object)? + "\n",
        _ => anyhow::bail!("Unknown format: {}", format),
    };

    match output {
        Some(path) => std::fs::write(&path, rendered).with_context(|| format!("Failed to write {}", path.display()))?,
        None => print!("{}", rendered),
    }
    Ok(())
}
