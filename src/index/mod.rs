// Cache data model and persistence

pub mod field_cache;
pub mod store;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Kinds of application objects, including extension variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Table,
    TableExtension,
    Page,
    PageExtension,
    Report,
    ReportExtension,
    Codeunit,
    Query,
    XmlPort,
    Enum,
    EnumExtension,
    Interface,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 12] = [
        ObjectKind::Table,
        ObjectKind::TableExtension,
        ObjectKind::Page,
        ObjectKind::PageExtension,
        ObjectKind::Report,
        ObjectKind::ReportExtension,
        ObjectKind::Codeunit,
        ObjectKind::Query,
        ObjectKind::XmlPort,
        ObjectKind::Enum,
        ObjectKind::EnumExtension,
        ObjectKind::Interface,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Table => "table",
            ObjectKind::TableExtension => "tableextension",
            ObjectKind::Page => "page",
            ObjectKind::PageExtension => "pageextension",
            ObjectKind::Report => "report",
            ObjectKind::ReportExtension => "reportextension",
            ObjectKind::Codeunit => "codeunit",
            ObjectKind::Query => "query",
            ObjectKind::XmlPort => "xmlport",
            ObjectKind::Enum => "enum",
            ObjectKind::EnumExtension => "enumextension",
            ObjectKind::Interface => "interface",
        }
    }

    /// Case-insensitive keyword lookup. Accepts legacy spellings such as `XMLport`.
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.trim().to_ascii_lowercase();
        ObjectKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lower)
    }

    pub fn is_extension(&self) -> bool {
        matches!(
            self,
            ObjectKind::TableExtension
                | ObjectKind::PageExtension
                | ObjectKind::ReportExtension
                | ObjectKind::EnumExtension
        )
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared application object. `name` is the cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// File name of the package that contributed this object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ObjectRecord {
    pub fn new(kind: ObjectKind, id: Option<i64>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            id,
            app: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// One exported routine of an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureRecord {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
}

/// Key of the procedure map: `"<objectType>:<objectName>"`
pub fn procedure_key(kind: ObjectKind, name: &str) -> String {
    format!("{}:{}", kind.as_str(), name)
}

pub const UNKNOWN_APP_NAME: &str = "Unknown";
pub const DEFAULT_APP_VERSION: &str = "1.0";

/// A compiled package on disk plus the identity derived from its file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppArtifact {
    pub path: PathBuf,
    pub app_name: String,
    pub app_version: String,
    /// False when name or version had to be defaulted
    pub conventional: bool,
}

impl AppArtifact {
    /// Decompose `<prefix>_<name>_<version>[.ext]`. Returns None only when the path
    /// has no usable file name at all.
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        let file_name = path.file_name()?.to_str()?;
        let has_alpha_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphabetic()))
            .unwrap_or(false);
        let stem = if has_alpha_ext {
            path.file_stem()?.to_str()?
        } else {
            file_name
        };
        if stem.trim().is_empty() {
            return None;
        }

        let segments: Vec<&str> = stem.split('_').collect();
        let (app_name, app_version, conventional) = match segments.len() {
            0 | 1 => (UNKNOWN_APP_NAME.to_string(), DEFAULT_APP_VERSION.to_string(), false),
            2 => (segments[1].to_string(), DEFAULT_APP_VERSION.to_string(), false),
            n => (segments[1..n - 1].join("_"), segments[n - 1].to_string(), true),
        };
        let conventional = conventional && !app_name.is_empty() && !app_version.is_empty();

        Some(Self {
            path: path.to_path_buf(),
            app_name: if app_name.is_empty() { UNKNOWN_APP_NAME.to_string() } else { app_name },
            app_version: if app_version.is_empty() {
                DEFAULT_APP_VERSION.to_string()
            } else {
                app_version
            },
            conventional,
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Directory name used for this app under the source extraction root.
    /// Defaulted identities get a hash suffix so distinct packages never collide.
    pub fn app_dir_name(&self) -> String {
        let base = sanitize_path_segment(&self.app_name);
        if self.conventional {
            base
        } else {
            format!("{}-{}", base, short_hash(self.file_name().as_bytes()))
        }
    }

    /// `<dest_base>/<sanitizedAppName>/<appVersion>`
    pub fn source_dir(&self, dest_base: &Path) -> PathBuf {
        dest_base
            .join(self.app_dir_name())
            .join(sanitize_path_segment(&self.app_version))
    }
}

/// Replace characters that are unsafe in a single path component.
pub fn sanitize_path_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_end_matches('.').trim();
    match trimmed {
        "" | "." | ".." => "_".to_string(),
        s => s.to_string(),
    }
}

/// First 8 hex chars of a blake3 digest
pub fn short_hash(bytes: &[u8]) -> String {
    let hex = blake3::hash(bytes).to_hex();
    hex.as_str()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_from_conventional_name() {
        let app = AppArtifact::from_path("/pkgs/Microsoft_Base Application_23.0.12034.0.app").unwrap();
        assert_eq!(app.app_name, "Base Application");
        assert_eq!(app.app_version, "23.0.12034.0");
        assert!(app.conventional);
        assert_eq!(app.app_dir_name(), "Base Application");
    }

    #[test]
    fn test_artifact_name_with_underscores() {
        let app = AppArtifact::from_path("Contoso_My_Ext_1.2.3.4.app").unwrap();
        assert_eq!(app.app_name, "My_Ext");
        assert_eq!(app.app_version, "1.2.3.4");
    }

    #[test]
    fn test_artifact_defaults_for_missing_segments() {
        let app = AppArtifact::from_path("/pkgs/standalone.app").unwrap();
        assert_eq!(app.app_name, UNKNOWN_APP_NAME);
        assert_eq!(app.app_version, DEFAULT_APP_VERSION);
        assert!(!app.conventional);

        let two = AppArtifact::from_path("/pkgs/Publisher_Thing.app").unwrap();
        assert_eq!(two.app_name, "Thing");
        assert_eq!(two.app_version, DEFAULT_APP_VERSION);
    }

    #[test]
    fn test_defaulted_names_do_not_collide() {
        let a = AppArtifact::from_path("/pkgs/first.app").unwrap();
        let b = AppArtifact::from_path("/pkgs/second.app").unwrap();
        let base = Path::new("/src");
        assert_ne!(a.source_dir(base), b.source_dir(base));
        assert!(a.app_dir_name().starts_with("Unknown-"));
    }

    #[test]
    fn test_version_without_extension_keeps_dots() {
        let app = AppArtifact::from_path("Pub_Name_1.2.3").unwrap();
        assert_eq!(app.app_version, "1.2.3");
    }

    #[test]
    fn test_sanitize_path_segment() {
        assert_eq!(sanitize_path_segment("A/B:C*D"), "A_B_C_D");
        assert_eq!(sanitize_path_segment(".."), "_");
        assert_eq!(sanitize_path_segment("Name. "), "Name");
    }

    #[test]
    fn test_object_kind_parse() {
        assert_eq!(ObjectKind::parse("Table"), Some(ObjectKind::Table));
        assert_eq!(ObjectKind::parse("XMLport"), Some(ObjectKind::XmlPort));
        assert_eq!(ObjectKind::parse("tableextension"), Some(ObjectKind::TableExtension));
        assert_eq!(ObjectKind::parse("MenuSuite"), None);
        assert!(ObjectKind::PageExtension.is_extension());
    }

    #[test]
    fn test_object_record_json_shape() {
        let record = ObjectRecord::new(ObjectKind::Codeunit, Some(80), "Sales-Post");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "codeunit");
        assert_eq!(json["id"], 80);
        assert!(json.get("metadata").is_none());
        assert_eq!(procedure_key(record.kind, &record.name), "codeunit:Sales-Post");
    }
}
