// Incremental table-field / page-source indexing of a source tree

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use super::parser::{declaration, field_names, read_lossy, source_files, source_table};
use super::scanner::{strip_comments, ScanMode};
use crate::index::field_cache::{FieldIndex, FileContribution};
use crate::index::ObjectKind;

/// Counters from one [`update_index`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStats {
    pub parsed: usize,
    pub unchanged: usize,
    pub removed: usize,
}

impl UpdateStats {
    pub fn changed(&self) -> bool {
        self.parsed > 0 || self.removed > 0
    }
}

/// What one source unit adds to the field index
pub fn parse_contribution(text: &str) -> FileContribution {
    let stripped = strip_comments(text, ScanMode::AL);
    let mut contribution = FileContribution::default();
    let Some(decl) = declaration(&stripped) else {
        return contribution;
    };
    let body = &stripped[decl.end..];

    match decl.kind {
        ObjectKind::Table => {
            contribution
                .tables
                .insert(decl.name.clone(), field_names(body).into_iter().collect());
            contribution.declared_table = Some(decl.name);
        }
        ObjectKind::TableExtension => match decl.extends {
            Some(target) => {
                contribution
                    .tables
                    .insert(target, field_names(body).into_iter().collect());
            }
            None => debug!("Table extension '{}' names no target", decl.name),
        },
        ObjectKind::Page => {
            contribution.pages.insert(decl.name, source_table(body));
        }
        _ => {}
    }
    contribution
}

/// Modification time in milliseconds since the epoch
pub fn file_watermark(path: &Path) -> std::io::Result<f64> {
    let modified = fs::metadata(path)?.modified()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).unwrap_or_default();
    Ok(since_epoch.as_secs_f64() * 1000.0)
}

/// Rescan `root`, reparsing only files whose watermark moved, and drop
/// contributions of files under `root` that no longer exist.
pub fn update_index(root: &Path, previous: FieldIndex) -> (FieldIndex, UpdateStats) {
    update_index_with(root, previous, |_, text| parse_contribution(text))
}

/// [`update_index`] with a caller-supplied per-file parser.
pub fn update_index_with<F>(root: &Path, previous: FieldIndex, mut parse: F) -> (FieldIndex, UpdateStats)
where
    F: FnMut(&Path, &str) -> FileContribution,
{
    let started = SystemTime::now();
    let mut index = previous;
    let mut stats = UpdateStats::default();
    let mut seen = HashSet::new();

    for file in source_files(root) {
        let key = file.to_string_lossy().into_owned();
        let watermark = match file_watermark(&file) {
            Ok(watermark) => watermark,
            Err(e) => {
                warn!("Cannot stat {}: {}", file.display(), e);
                continue;
            }
        };
        seen.insert(key.clone());

        if index.watermarks.get(&key) == Some(&watermark) && index.contributions.contains_key(&key) {
            stats.unchanged += 1;
            continue;
        }

        let text = match read_lossy(&file) {
            Ok(text) => text,
            Err(e) => {
                warn!("Skipping {:#}", e);
                continue;
            }
        };
        let contribution = parse(&file, &text);
        index.apply_contribution(&key, contribution);
        index.watermarks.insert(key, watermark);
        stats.parsed += 1;
    }

    for stale in index.paths_under(root) {
        let key = stale.to_string_lossy().into_owned();
        if !seen.contains(&key) {
            debug!("Retracting deleted file {}", key);
            index.retract(&key);
            stats.removed += 1;
        }
    }

    info!(
        "Field index update of {}: {} parsed, {} unchanged, {} removed in {:?}",
        root.display(),
        stats.parsed,
        stats.unchanged,
        stats.removed,
        started.elapsed().unwrap_or_default()
    );
    (index, stats)
}
