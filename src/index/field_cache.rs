// Persisted table-field / page-source index

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::store::{read_snapshot, write_snapshot};
use crate::error::CacheIoError;

pub const FIELD_METADATA_FILE: &str = "fieldCacheMetadata.json";
pub const FIELD_TABLE_FILE: &str = "fieldTableCache.json";
pub const FIELD_PAGE_FILE: &str = "fieldPageCache.json";
pub const FIELD_CONTRIBUTIONS_FILE: &str = "fieldCacheContributions.json";

/// What a single source file added to the index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContribution {
    #[serde(default)]
    pub tables: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub pages: BTreeMap<String, Option<String>>,
    /// Table this file declares, as opposed to one it extends
    #[serde(default, rename = "declaredTable", skip_serializing_if = "Option::is_none")]
    pub declared_table: Option<String>,
}

impl FileContribution {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.pages.is_empty()
    }
}

/// Table fields, page source tables and file watermarks.
///
/// `table_fields` and `page_sources` are derived from `contributions`; the
/// derived maps are what consumers read and what the cache files carry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldIndex {
    pub table_fields: BTreeMap<String, Vec<String>>,
    pub page_sources: BTreeMap<String, Option<String>>,
    /// Absolute file path -> modification time in milliseconds
    pub watermarks: BTreeMap<String, f64>,
    pub contributions: BTreeMap<String, FileContribution>,
}

impl FieldIndex {
    /// Load all four snapshots from `dir`. Failures degrade to empty maps.
    pub fn load(dir: &Path) -> Self {
        let mut index = Self {
            table_fields: load_or_default(&dir.join(FIELD_TABLE_FILE)),
            page_sources: load_or_default(&dir.join(FIELD_PAGE_FILE)),
            watermarks: load_or_default(&dir.join(FIELD_METADATA_FILE)),
            contributions: BTreeMap::new(),
        };

        match read_snapshot(&dir.join(FIELD_CONTRIBUTIONS_FILE)) {
            Ok(Some(contributions)) => {
                index.contributions = contributions;
                index
            }
            Ok(None) | Err(_) => {
                // Without the ledger nothing can be retracted, so start over.
                if !index.watermarks.is_empty()
                    || !index.table_fields.is_empty()
                    || !index.page_sources.is_empty()
                {
                    warn!("Field cache has no contribution ledger, forcing a full rescan");
                }
                Self::default()
            }
        }
    }

    pub fn save(&self, dir: &Path) -> Result<(), CacheIoError> {
        fs::create_dir_all(dir).map_err(|source| CacheIoError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        write_snapshot(&dir.join(FIELD_TABLE_FILE), &self.table_fields)?;
        write_snapshot(&dir.join(FIELD_PAGE_FILE), &self.page_sources)?;
        write_snapshot(&dir.join(FIELD_METADATA_FILE), &self.watermarks)?;
        write_snapshot(&dir.join(FIELD_CONTRIBUTIONS_FILE), &self.contributions)?;
        info!(
            "Saved field cache: {} tables, {} pages, {} files",
            self.table_fields.len(),
            self.page_sources.len(),
            self.watermarks.len()
        );
        Ok(())
    }

    /// Case-insensitive table lookup
    pub fn fields_for_table(&self, table: &str) -> Option<&[String]> {
        self.table_fields
            .get(table)
            .or_else(|| {
                self.table_fields
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(table))
                    .map(|(_, fields)| fields)
            })
            .map(Vec::as_slice)
    }

    /// `Some(None)` means the page is known and has no source table.
    pub fn source_table_for_page(&self, page: &str) -> Option<Option<&str>> {
        self.page_sources.get(page).map(|s| s.as_deref())
    }

    /// Swap in `contribution` for `path` and recompute every table/page it or its
    /// predecessor touched.
    pub fn apply_contribution(&mut self, path: &str, contribution: FileContribution) {
        let previous = self.contributions.remove(path);
        let mut tables: BTreeSet<String> = contribution.tables.keys().cloned().collect();
        let mut pages: BTreeSet<String> = contribution.pages.keys().cloned().collect();
        if let Some(prev) = &previous {
            tables.extend(prev.tables.keys().cloned());
            pages.extend(prev.pages.keys().cloned());
        }
        self.contributions.insert(path.to_string(), contribution);
        self.recompute(&tables, &pages);
    }

    /// Drop everything `path` contributed, including its watermark.
    pub fn retract(&mut self, path: &str) {
        self.watermarks.remove(path);
        if let Some(prev) = self.contributions.remove(path) {
            let tables: BTreeSet<String> = prev.tables.into_keys().collect();
            let pages: BTreeSet<String> = prev.pages.into_keys().collect();
            self.recompute(&tables, &pages);
        }
    }

    fn recompute(&mut self, tables: &BTreeSet<String>, pages: &BTreeSet<String>) {
        for table in tables {
            // Table names are case-insensitive; the declaring file's spelling wins.
            let mut union: BTreeSet<String> = BTreeSet::new();
            let mut spelling: Option<&String> = None;
            let mut declared: Option<&String> = None;
            for contribution in self.contributions.values() {
                for (name, fields) in &contribution.tables {
                    if !name.eq_ignore_ascii_case(table) {
                        continue;
                    }
                    union.extend(fields.iter().cloned());
                    if contribution.declared_table.as_ref() == Some(name) {
                        declared = Some(name);
                    }
                    if spelling.map_or(true, |s| name < s) {
                        spelling = Some(name);
                    }
                }
            }
            let key = declared.or(spelling).cloned();

            self.table_fields.retain(|name, _| !name.eq_ignore_ascii_case(table));
            if let Some(key) = key {
                self.table_fields.insert(key, union.into_iter().collect());
            }
        }

        for page in pages {
            let mut known = false;
            let mut source: Option<String> = None;
            for contribution in self.contributions.values() {
                if let Some(value) = contribution.pages.get(page) {
                    known = true;
                    if value.is_some() {
                        source = value.clone();
                    }
                }
            }
            if known {
                self.page_sources.insert(page.clone(), source);
            } else {
                self.page_sources.remove(page);
            }
        }
    }

    /// Watermark paths that live below `root`
    pub fn paths_under(&self, root: &Path) -> Vec<PathBuf> {
        self.watermarks
            .keys()
            .map(PathBuf::from)
            .filter(|p| p.starts_with(root))
            .collect()
    }
}

fn load_or_default<T: Default + serde::de::DeserializeOwned>(path: &Path) -> T {
    match read_snapshot(path) {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(e) => {
            error!("Ignoring unreadable field cache file: {}", e);
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn table(name: &str, fields: &[&str]) -> FileContribution {
        let mut c = FileContribution::default();
        c.tables.insert(
            name.to_string(),
            fields.iter().map(|f| f.to_string()).collect(),
        );
        c
    }

    #[test]
    fn test_union_across_files() {
        let mut index = FieldIndex::default();
        index.apply_contribution("/src/Customer.Table.al", table("Customer", &["A", "B"]));
        index.apply_contribution("/src/CustExt.TableExt.al", table("Customer", &["C", "A"]));
        assert_eq!(index.fields_for_table("Customer").unwrap(), ["A", "B", "C"]);
    }

    #[test]
    fn test_table_names_merge_case_insensitively() {
        let mut base = table("Customer", &["No.", "Name"]);
        base.declared_table = Some("Customer".to_string());
        let ext = table("customer", &["Loyalty Tier"]);

        let mut forward = FieldIndex::default();
        forward.apply_contribution("/src/Customer.Table.al", base.clone());
        forward.apply_contribution("/src/CustExt.TableExt.al", ext.clone());

        let mut backward = FieldIndex::default();
        backward.apply_contribution("/src/CustExt.TableExt.al", ext);
        assert_eq!(backward.table_fields.keys().collect::<Vec<_>>(), ["customer"]);
        backward.apply_contribution("/src/Customer.Table.al", base);

        for index in [&forward, &backward] {
            assert_eq!(index.table_fields.len(), 1);
            assert_eq!(index.table_fields["Customer"], ["Loyalty Tier", "Name", "No."]);
        }

        backward.retract("/src/Customer.Table.al");
        assert_eq!(backward.table_fields.keys().collect::<Vec<_>>(), ["customer"]);
        assert_eq!(backward.table_fields["customer"], ["Loyalty Tier"]);
    }

    #[test]
    fn test_retract_removes_only_own_fields() {
        let mut index = FieldIndex::default();
        index.apply_contribution("/src/a.al", table("Customer", &["A", "B"]));
        index.apply_contribution("/src/b.al", table("Customer", &["C"]));
        index.watermarks.insert("/src/b.al".to_string(), 1.0);

        index.retract("/src/b.al");
        assert_eq!(index.fields_for_table("customer").unwrap(), ["A", "B"]);
        assert!(index.watermarks.is_empty());

        index.retract("/src/a.al");
        assert!(index.fields_for_table("Customer").is_none());
    }

    #[test]
    fn test_page_without_source_is_recorded_as_null() {
        let mut index = FieldIndex::default();
        let mut c = FileContribution::default();
        c.pages.insert("Role Center".to_string(), None);
        index.apply_contribution("/src/rc.al", c);
        assert_eq!(index.source_table_for_page("Role Center"), Some(None));
        assert_eq!(index.source_table_for_page("Other"), None);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempdir().unwrap();
        let mut index = FieldIndex::default();
        index.apply_contribution("/src/a.al", table("Item", &["No."]));
        index.watermarks.insert("/src/a.al".to_string(), 1700000000123.5);
        index.save(dir.path()).unwrap();

        assert!(dir.path().join(FIELD_TABLE_FILE).exists());
        assert_eq!(FieldIndex::load(dir.path()), index);
    }

    #[test]
    fn test_missing_ledger_forces_rescan() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(FIELD_METADATA_FILE),
            r#"{"/src/a.al": 12.0}"#,
        )
        .unwrap();
        fs::write(dir.path().join(FIELD_TABLE_FILE), r#"{"Item": ["No."]}"#).unwrap();

        fs::write(dir.path().join(FIELD_PAGE_FILE), r#"{"Item Card": "Item"}"#).unwrap();

        let index = FieldIndex::load(dir.path());
        assert_eq!(index, FieldIndex::default());
        assert!(index.fields_for_table("Item").is_none());
        assert_eq!(index.source_table_for_page("Item Card"), None);
    }
}
