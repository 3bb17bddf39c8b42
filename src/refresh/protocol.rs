//! Coordinator <-> worker messages.
//!
//! One JSON object per line over the worker's stdin/stdout, discriminated by a
//! `type` field:
//!
//! - Request: `{"type":"process","appPath":...,"options":{...}}`
//! - Response: `{"type":"success","symbols":[...],"procedures":{...},"appPath":...}`

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::index::field_cache::{FieldIndex, FileContribution};
use crate::index::{ObjectRecord, ProcedureRecord};

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// Shared options carried by every `process` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOptions {
    pub cache_path: PathBuf,
    /// Scratch root; each worker unpacks into its own subdirectory
    pub extract_path: PathBuf,
    #[serde(default)]
    pub enable_src_extraction: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_extraction_path: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_true")]
    pub extract_procedures: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldCacheOptions {
    pub src_extraction_path: PathBuf,
    /// Directory holding the persisted field cache files
    pub global_storage_path: PathBuf,
    /// Restrict the scan to one app's extracted sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Coordinator -> worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    Process {
        #[serde(rename = "appPath")]
        app_path: PathBuf,
        options: ProcessOptions,
    },
    UpdateFieldCache {
        options: FieldCacheOptions,
    },
    SetLogLevel {
        #[serde(rename = "logLevel")]
        log_level: String,
    },
}

/// Worker -> coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    Progress {
        message: String,
    },
    Warning {
        message: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        #[serde(rename = "appPath", default, skip_serializing_if = "Option::is_none")]
        app_path: Option<PathBuf>,
    },
    Success {
        symbols: Vec<ObjectRecord>,
        procedures: BTreeMap<String, Vec<ProcedureRecord>>,
        #[serde(rename = "appPath")]
        app_path: PathBuf,
    },
    FieldCacheData {
        #[serde(rename = "tableFieldsCache")]
        table_fields_cache: BTreeMap<String, Vec<String>>,
        #[serde(rename = "pageSourceTableCache")]
        page_source_table_cache: BTreeMap<String, Option<String>>,
        metadata: BTreeMap<String, f64>,
        #[serde(default)]
        contributions: BTreeMap<String, FileContribution>,
    },
    FieldCacheError {
        message: String,
    },
}

impl Response {
    pub fn progress(message: impl Into<String>) -> Self {
        Response::Progress {
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Response::Warning {
            message: message.into(),
        }
    }

    pub fn field_cache_data(index: FieldIndex) -> Self {
        Response::FieldCacheData {
            table_fields_cache: index.table_fields,
            page_source_table_cache: index.page_sources,
            metadata: index.watermarks,
            contributions: index.contributions,
        }
    }

    /// Value of the `type` discriminator
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Progress { .. } => "progress",
            Response::Warning { .. } => "warning",
            Response::Error { .. } => "error",
            Response::Success { .. } => "success",
            Response::FieldCacheData { .. } => "fieldCacheData",
            Response::FieldCacheError { .. } => "fieldCacheError",
        }
    }

    /// `error` and `success` end a `process` exchange.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Response::Error { .. } | Response::Success { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ObjectKind;
    use serde_json::json;

    #[test]
    fn test_process_request_wire_format() {
        let request = Request::Process {
            app_path: PathBuf::from("/p/.alpackages/Contoso_Sales_1.0.0.0.app"),
            options: ProcessOptions {
                cache_path: PathBuf::from("/p/.alcache"),
                extract_path: PathBuf::from("/tmp/scratch"),
                enable_src_extraction: true,
                src_extraction_path: Some(PathBuf::from("/p/.alcache/src")),
                log_level: "info".to_string(),
                extract_procedures: true,
            },
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["type"], "process");
        assert_eq!(value["appPath"], "/p/.alpackages/Contoso_Sales_1.0.0.0.app");
        assert_eq!(value["options"]["cachePath"], "/p/.alcache");
        assert_eq!(value["options"]["extractPath"], "/tmp/scratch");
        assert_eq!(value["options"]["enableSrcExtraction"], true);
        assert_eq!(value["options"]["srcExtractionPath"], "/p/.alcache/src");
        assert_eq!(value["options"]["logLevel"], "info");
        assert_eq!(value["options"]["extractProcedures"], true);
    }

    #[test]
    fn test_minimal_process_request_defaults() {
        let request: Request = serde_json::from_value(json!({
            "type": "process",
            "appPath": "/a.app",
            "options": {"cachePath": "/c", "extractPath": "/x"}
        }))
        .unwrap();

        let Request::Process { options, .. } = request else {
            panic!("expected a process request");
        };
        assert!(!options.enable_src_extraction);
        assert!(options.extract_procedures);
        assert_eq!(options.log_level, "warn");
    }

    #[test]
    fn test_other_request_tags() {
        let request: Request = serde_json::from_str(r#"{"type":"setLogLevel","logLevel":"debug"}"#).unwrap();
        assert_eq!(
            request,
            Request::SetLogLevel {
                log_level: "debug".to_string()
            }
        );

        let request: Request = serde_json::from_value(json!({
            "type": "updateFieldCache",
            "options": {"srcExtractionPath": "/s", "globalStoragePath": "/g", "appName": "Sales"}
        }))
        .unwrap();
        let Request::UpdateFieldCache { options } = request else {
            panic!("expected an updateFieldCache request");
        };
        assert_eq!(options.app_name.as_deref(), Some("Sales"));
    }

    #[test]
    fn test_response_wire_format() {
        let success = Response::Success {
            symbols: vec![ObjectRecord::new(ObjectKind::Table, Some(18), "Customer")],
            procedures: BTreeMap::new(),
            app_path: PathBuf::from("/a.app"),
        };
        let value = serde_json::to_value(&success).unwrap();
        assert_eq!(value["type"], "success");
        assert_eq!(value["symbols"][0]["type"], "table");
        assert_eq!(value["appPath"], "/a.app");
        assert!(success.is_terminal());

        let data = Response::field_cache_data(FieldIndex::default());
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["type"], "fieldCacheData");
        assert!(value["tableFieldsCache"].is_object());
        assert!(value["pageSourceTableCache"].is_object());
        assert!(value["metadata"].is_object());
        assert!(!data.is_terminal());

        let error: Response =
            serde_json::from_str(r#"{"type":"error","message":"boom","stack":null}"#).unwrap();
        assert_eq!(error.kind(), "error");
    }
}
