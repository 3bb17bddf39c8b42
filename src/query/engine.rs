// Query execution engine

use std::collections::BTreeSet;

use regex::Regex;

use crate::index::field_cache::FieldIndex;
use crate::index::store::CacheStore;
use crate::index::{ObjectKind, ObjectRecord, ProcedureRecord};
use crate::indexer::legacy::is_legacy_dialect;
use crate::indexer::parser::unquote;
use crate::indexer::scanner::{strip_comments, ScanMode};

/// Read-only lookups over a loaded cache. Nothing here touches disk.
pub struct QueryEngine<'a> {
    store: &'a CacheStore,
    fields: &'a FieldIndex,
}

impl<'a> QueryEngine<'a> {
    pub fn new(store: &'a CacheStore, fields: &'a FieldIndex) -> Self {
        Self { store, fields }
    }

    pub fn get_object_info(&self, name: &str) -> Option<&'a ObjectRecord> {
        self.store.get_object(name)
    }

    pub fn get_object_id(&self, name: &str) -> Option<i64> {
        self.store.get_object_id(name)
    }

    pub fn get_procedures(&self, kind: ObjectKind, name: &str) -> &'a [ProcedureRecord] {
        self.store.get_procedures(kind, name)
    }

    /// Fields from the source-derived index, or else from the cached table and
    /// its extensions.
    pub fn get_fields_for_table(&self, table: &str) -> Vec<String> {
        if let Some(fields) = self.fields.fields_for_table(table) {
            return fields.to_vec();
        }

        let mut fields = BTreeSet::new();
        for record in self.store.objects().values() {
            let contributes = match record.kind {
                ObjectKind::Table => record.name.eq_ignore_ascii_case(table),
                ObjectKind::TableExtension => record
                    .meta_str("extends")
                    .is_some_and(|target| target.eq_ignore_ascii_case(table)),
                _ => false,
            };
            if !contributes {
                continue;
            }
            if let Some(names) = record.metadata.get("fields").and_then(|v| v.as_array()) {
                fields.extend(names.iter().filter_map(|n| n.as_str()).map(str::to_string));
            }
        }
        fields.into_iter().collect()
    }

    /// Source table of a page, from the field index or the cached page record.
    pub fn get_source_table(&self, page: &str) -> Option<String> {
        match self.fields.source_table_for_page(page) {
            Some(source) => source.map(str::to_string),
            None => self
                .store
                .get_object(page)
                .and_then(|o| o.meta_str("sourceTable"))
                .map(str::to_string),
        }
    }

    /// Record type of `variable` as declared in `source`.
    ///
    /// Understands `Name: Record "Table"` and the legacy `Name@1000 : Record 18`,
    /// resolving numeric ids through the cached tables.
    pub fn guess_table_type(&self, source: &str, variable: &str) -> Option<String> {
        let variable = variable.trim();
        if variable.is_empty() {
            return None;
        }
        let text = if is_legacy_dialect(source) {
            source.to_string()
        } else {
            strip_comments(source, ScanMode::AL)
        };

        let name = regex::escape(variable.trim_matches('"'));
        let pattern = format!(
            r#"(?i)(?:^|[^A-Za-z0-9_"])"?{}"?(?:@\d+)?\s*:\s*(?:temporary\s+)?record\s+("(?:[^"]|"")*"|[A-Za-z0-9_]+)"#,
            name
        );
        let caps = Regex::new(&pattern).ok()?.captures(&text)?;
        let target = caps.get(1)?.as_str();

        match target.parse::<i64>() {
            Ok(id) => self
                .store
                .find_by_id(ObjectKind::Table, id)
                .map(|table| table.name.clone()),
            Err(_) => Some(unquote(target)),
        }
    }

    /// Objects whose name contains `query` (case-insensitive), sorted by name.
    pub fn search_objects(&self, query: &str, kind: Option<ObjectKind>, limit: usize) -> Vec<&'a ObjectRecord> {
        let needle = query.to_lowercase();
        let mut results: Vec<&ObjectRecord> = self
            .store
            .objects()
            .values()
            .filter(|o| kind.map_or(true, |k| o.kind == k))
            .filter(|o| o.name.to_lowercase().contains(&needle))
            .collect();
        results.sort_by(|a, b| a.name.cmp(&b.name));
        results.truncate(limit);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::field_cache::FileContribution;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn store(dir: &std::path::Path) -> CacheStore {
        let mut store = CacheStore::new(dir);
        let objects: HashMap<String, ObjectRecord> = [
            ObjectRecord::new(ObjectKind::Table, Some(18), "Customer").with_meta("fields", serde_json::json!(["No.", "Name"])),
            ObjectRecord::new(ObjectKind::TableExtension, Some(50100), "CustExt")
                .with_meta("extends", "Customer")
                .with_meta("fields", serde_json::json!(["Loyalty Tier"])),
            ObjectRecord::new(ObjectKind::Page, Some(21), "Customer Card").with_meta("sourceTable", "Customer"),
            ObjectRecord::new(ObjectKind::Codeunit, Some(80), "Sales-Post"),
        ]
        .into_iter()
        .map(|o| (o.name.clone(), o))
        .collect();
        store.replace_objects(objects);
        store.set_procedures(
            ObjectKind::Codeunit,
            "Sales-Post",
            vec![ProcedureRecord {
                name: "Run".to_string(),
                parameters: vec![],
                return_type: None,
            }],
        );
        store
    }

    #[test]
    fn test_object_lookups() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let fields = FieldIndex::default();
        let engine = QueryEngine::new(&store, &fields);

        assert_eq!(engine.get_object_info("Customer").unwrap().kind, ObjectKind::Table);
        assert_eq!(engine.get_object_id("Sales-Post"), Some(80));
        assert_eq!(engine.get_object_id("Missing"), None);
        assert_eq!(engine.get_procedures(ObjectKind::Codeunit, "Sales-Post")[0].name, "Run");
        assert!(engine.get_procedures(ObjectKind::Page, "Sales-Post").is_empty());
        assert_eq!(engine.get_source_table("Customer Card").as_deref(), Some("Customer"));
    }

    #[test]
    fn test_fields_prefer_field_index() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut fields = FieldIndex::default();

        let engine = QueryEngine::new(&store, &fields);
        assert_eq!(engine.get_fields_for_table("customer"), ["Loyalty Tier", "Name", "No."]);

        let mut contribution = FileContribution::default();
        contribution
            .tables
            .insert("Customer".to_string(), ["E-Mail".to_string()].into_iter().collect());
        fields.apply_contribution("/src/Customer.Table.al", contribution);
        let engine = QueryEngine::new(&store, &fields);
        assert_eq!(engine.get_fields_for_table("Customer"), ["E-Mail"]);
    }

    #[test]
    fn test_guess_table_type() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let fields = FieldIndex::default();
        let engine = QueryEngine::new(&store, &fields);

        let modern = "var\n    // Old: Record Vendor;\n    Cust: Record Customer;\n    \"Sales Line\": Record \"Sales Line\" temporary;\n";
        assert_eq!(engine.guess_table_type(modern, "Cust").as_deref(), Some("Customer"));
        assert_eq!(engine.guess_table_type(modern, "Sales Line").as_deref(), Some("Sales Line"));
        assert_eq!(engine.guess_table_type(modern, "Old"), None);
        assert_eq!(engine.guess_table_type(modern, "Missing"), None);

        let legacy = "OBJECT Codeunit 50000 Helper\n{\n  CODE\n  {\n    VAR\n      Cust@1000 : Record 18;\n      Unknown@1001 : Record 99999;\n\n    BEGIN\n    END.\n  }\n}\n";
        assert_eq!(engine.guess_table_type(legacy, "Cust").as_deref(), Some("Customer"));
        assert_eq!(engine.guess_table_type(legacy, "Unknown"), None);
    }

    #[test]
    fn test_search_objects() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let fields = FieldIndex::default();
        let engine = QueryEngine::new(&store, &fields);

        let names: Vec<&str> = engine.search_objects("cust", None, 10).iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, ["CustExt", "Customer", "Customer Card"]);
        assert_eq!(engine.search_objects("cust", Some(ObjectKind::Page), 10).len(), 1);
        assert_eq!(engine.search_objects("", None, 2).len(), 2);
    }
}
