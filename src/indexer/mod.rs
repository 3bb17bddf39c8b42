// Package extraction, metadata parsing and field indexing

pub mod extract;
pub mod fields;
pub mod legacy;
pub mod parser;
pub mod scanner;
pub mod watcher;

use std::path::Path;

use tracing::debug;

use parser::{collect_procedures, default_parsers, MetadataParser, ParseOptions, ParsedMetadata};

/// Picks a metadata strategy for an extracted package tree and runs it
pub struct Indexer {
    parsers: Vec<Box<dyn MetadataParser>>,
}

impl Default for Indexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Indexer {
    pub fn new() -> Self {
        Self {
            parsers: default_parsers(),
        }
    }

    pub fn can_index_tree(&self, tree: &Path) -> bool {
        self.parsers.iter().any(|p| p.can_parse(tree))
    }

    pub fn get_parser_for_tree(&self, tree: &Path) -> Option<&dyn MetadataParser> {
        self.parsers
            .iter()
            .find(|p| p.can_parse(tree))
            .map(|p| p.as_ref())
    }

    /// Parse objects from `tree`, then (if enabled) overlay procedure lists read
    /// from any source units in it.
    pub fn index_tree(&self, tree: &Path, options: &ParseOptions) -> anyhow::Result<ParsedMetadata> {
        let parser = self
            .get_parser_for_tree(tree)
            .ok_or_else(|| anyhow::anyhow!("No metadata found in {}", tree.display()))?;
        debug!("Parsing {} with the {} strategy", tree.display(), parser.name());

        let mut parsed = parser.parse(tree, options)?;
        if options.extract_procedures {
            parsed.procedures.extend(collect_procedures(tree));
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ObjectKind;
    use std::fs;
    use tempfile::tempdir;

    const CODEUNIT: &str = "codeunit 50100 \"Sales Helper\"\n{\n    procedure Post(DocNo: Code[20]): Boolean\n    begin\n    end;\n}\n";

    #[test]
    fn test_empty_tree_has_no_parser() {
        let dir = tempdir().unwrap();
        let indexer = Indexer::new();
        assert!(!indexer.can_index_tree(dir.path()));
        assert!(indexer.index_tree(dir.path(), &ParseOptions::default()).is_err());
    }

    #[test]
    fn test_source_tree_indexing() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/SalesHelper.Codeunit.al"), CODEUNIT).unwrap();

        let indexer = Indexer::new();
        assert_eq!(indexer.get_parser_for_tree(dir.path()).unwrap().name(), "source-text");

        let parsed = indexer.index_tree(dir.path(), &ParseOptions::default()).unwrap();
        assert_eq!(parsed.objects.len(), 1);
        assert_eq!(parsed.objects[0].kind, ObjectKind::Codeunit);
        assert_eq!(parsed.procedures["codeunit:Sales Helper"][0].name, "Post");

        let without = indexer
            .index_tree(dir.path(), &ParseOptions { extract_procedures: false })
            .unwrap();
        assert!(without.procedures.is_empty());
    }

    #[test]
    fn test_permission_set_does_not_shadow_table() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(
            dir.path().join("src/AlphaTable.Table.al"),
            "table 50100 \"Alpha Table\"\n{\n    fields\n    {\n        field(1; Code; Code[20]) { }\n    }\n}\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("src/Perms.PermissionSet.al"),
            "permissionset 50100 \"Alpha Perms\"\n{\n    Permissions = table \"Alpha Table\" = X;\n}\n",
        )
        .unwrap();

        let parsed = Indexer::new().index_tree(dir.path(), &ParseOptions::default()).unwrap();
        assert_eq!(parsed.objects.len(), 1);
        assert_eq!(parsed.objects[0].name, "Alpha Table");
        assert_eq!(parsed.objects[0].id, Some(50100));
    }
}
