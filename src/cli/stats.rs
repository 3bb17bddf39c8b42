use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Local};

use super::Project;
use crate::index::field_cache::{FieldIndex, FIELD_TABLE_FILE};
use crate::index::store::CacheStore;

pub async fn show_stats(project: String, detailed: bool) -> Result<()> {
    let project = Project::open(&project)?;
    let options = project.refresh_options();
    let store = project.open_store();
    let fields = FieldIndex::load(&options.cache_dir);

    println!("Project: {}", project.config.project.name);
    println!("Cache: {}", options.cache_dir.display());

    println!("\nSymbol cache:");
    println!("  Objects: {}", store.objects().len());
    println!("  Objects with procedures: {}", store.list_objects_with_procedures().len());
    println!("  Procedures: {}", store.procedure_count());
    println!("  Size on disk: {:.2} MB", cache_size(&store));
    println!("  Last written: {}", describe_time(last_modified(&store.symbols_path())));

    println!("\nField index:");
    println!("  Tables: {}", fields.table_fields.len());
    println!("  Pages: {}", fields.page_sources.len());
    println!("  Source files: {}", fields.watermarks.len());
    println!(
        "  Last written: {}",
        describe_time(last_modified(&options.cache_dir.join(FIELD_TABLE_FILE)))
    );

    if detailed {
        println!("\nObjects by type:");
        for (kind, count) in objects_by_kind(&store) {
            println!("    {}: {}", kind, count);
        }

        println!("\nObjects by package:");
        for (app, count) in objects_by_app(&store) {
            println!("    {}: {}", app, count);
        }
    }

    Ok(())
}

fn file_size_mb(path: &Path) -> f64 {
    std::fs::metadata(path)
        .map(|m| m.len() as f64 / (1024.0 * 1024.0))
        .unwrap_or(0.0)
}

fn last_modified(path: &Path) -> Option<DateTime<Local>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Local>::from)
}

fn describe_time(time: Option<DateTime<Local>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string())
}

fn cache_size(store: &CacheStore) -> f64 {
    file_size_mb(&store.symbols_path()) + file_size_mb(&store.procedures_path())
}

fn objects_by_kind(store: &CacheStore) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for object in store.objects().values() {
        *counts.entry(object.kind.to_string()).or_default() += 1;
    }
    sorted_by_count(counts)
}

fn objects_by_app(store: &CacheStore) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for object in store.objects().values() {
        let app = object.app.clone().unwrap_or_else(|| "(unknown)".to_string());
        *counts.entry(app).or_default() += 1;
    }
    sorted_by_count(counts)
}

fn sorted_by_count(counts: BTreeMap<String, usize>) -> Vec<(String, usize)> {
    let mut results: Vec<(String, usize)> = counts.into_iter().collect();
    results.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{ObjectKind, ObjectRecord};
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_grouped_counts() {
        let dir = tempdir().unwrap();
        let mut store = CacheStore::new(dir.path());
        let mut table = ObjectRecord::new(ObjectKind::Table, Some(18), "Customer");
        table.app = Some("Base.app".to_string());
        let mut page = ObjectRecord::new(ObjectKind::Page, Some(21), "Customer Card");
        page.app = Some("Base.app".to_string());
        let codeunit = ObjectRecord::new(ObjectKind::Codeunit, Some(80), "Sales-Post");
        let objects: HashMap<String, ObjectRecord> = [table, page, codeunit]
            .into_iter()
            .map(|o| (o.name.clone(), o))
            .collect();
        store.replace_objects(objects);

        assert_eq!(
            objects_by_app(&store),
            vec![("Base.app".to_string(), 2), ("(unknown)".to_string(), 1)]
        );
        assert_eq!(objects_by_kind(&store).len(), 3);
        assert_eq!(cache_size(&store), 0.0);
        assert_eq!(describe_time(last_modified(&store.symbols_path())), "never");

        store.save().unwrap();
        assert!(last_modified(&store.symbols_path()).is_some());
    }
}
