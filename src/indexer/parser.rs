// Metadata parsers

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::legacy::{self, LegacyObject};
use super::scanner::{locate_block, strip_comments, BlockLookup, ScanMode, ScanState, Scanner};
use crate::index::{procedure_key, ObjectKind, ObjectRecord, ProcedureRecord};

pub use super::legacy::is_legacy_dialect;

/// Structured metadata document shipped inside compiled packages
pub const SYMBOL_REFERENCE_FILE: &str = "SymbolReference.json";

/// Extension of AL source files
pub const SOURCE_EXTENSION: &str = "al";

/// Extension of exported C/AL object text
pub const LEGACY_EXPORT_EXTENSION: &str = "txt";

static DECLARATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\A(tableextension|pageextension|reportextension|enumextension|table|page|report|codeunit|query|xmlport|enum|interface)[ \t]+(?:(\d+)[ \t]+)?("(?:[^"\n]|"")+"|[A-Za-z_][A-Za-z0-9_]*)(?:[ \t]+extends[ \t]+("(?:[^"\n]|"")+"|[A-Za-z_][A-Za-z0-9_]*))?"#,
    )
    .expect("declaration pattern is valid")
});

static FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bfield\s*\(\s*\d+\s*;\s*("(?:[^"\n]|"")+"|[A-Za-z_][A-Za-z0-9_]*)\s*;"#)
        .expect("field pattern is valid")
});

static SOURCE_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bSourceTable\s*=\s*("(?:[^"\n]|"")+"|[A-Za-z_][A-Za-z0-9_]*)\s*;"#)
        .expect("source table pattern is valid")
});

static CAPTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bCaption\s*=\s*'((?:[^'\n]|'')*)'").expect("caption pattern is valid")
});

static DATA_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bdataitem\s*\(\s*("(?:[^"\n]|"")+"|[A-Za-z_][A-Za-z0-9_]*)\s*;"#)
        .expect("dataitem pattern is valid")
});

static PROCEDURE_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^\s*((?:[A-Za-z]+\s+)*?)procedure\s+("(?:[^"]|"")+"|[A-Za-z_][A-Za-z0-9_]*)(?:@\d+)?\s*\((.*)$"#)
        .expect("procedure pattern is valid")
});

/// Objects and procedures produced by one parse
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMetadata {
    pub objects: Vec<ObjectRecord>,
    pub procedures: BTreeMap<String, Vec<ProcedureRecord>>,
}

impl ParsedMetadata {
    /// Append objects and assign procedure lists key by key.
    pub fn merge(&mut self, other: ParsedMetadata) {
        self.objects.extend(other.objects);
        self.procedures.extend(other.procedures);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub extract_procedures: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            extract_procedures: true,
        }
    }
}

/// One way of turning an extracted package tree into object records
pub trait MetadataParser: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_parse(&self, tree: &Path) -> bool;
    fn parse(&self, tree: &Path, options: &ParseOptions) -> anyhow::Result<ParsedMetadata>;
}

/// Reads `SymbolReference.json`
pub struct StructuredDocumentParser;

/// Scans decompiled `.al` source units and C/AL `.txt` exports
pub struct SourceTextParser;

impl MetadataParser for StructuredDocumentParser {
    fn name(&self) -> &'static str {
        "structured-document"
    }

    fn can_parse(&self, tree: &Path) -> bool {
        tree.join(SYMBOL_REFERENCE_FILE).is_file()
    }

    fn parse(&self, tree: &Path, options: &ParseOptions) -> anyhow::Result<ParsedMetadata> {
        let path = tree.join(SYMBOL_REFERENCE_FILE);
        let content = read_lossy(&path)?;
        let mut parsed = parse_symbol_document(&content)
            .with_context(|| format!("{} is not a symbol document", path.display()))?;
        if !options.extract_procedures {
            parsed.procedures.clear();
        }
        Ok(parsed)
    }
}

impl MetadataParser for SourceTextParser {
    fn name(&self) -> &'static str {
        "source-text"
    }

    fn can_parse(&self, tree: &Path) -> bool {
        object_files(tree).iter().any(|file| {
            is_source_file(file) || read_lossy(file).is_ok_and(|text| is_legacy_dialect(&text))
        })
    }

    fn parse(&self, tree: &Path, _options: &ParseOptions) -> anyhow::Result<ParsedMetadata> {
        let mut parsed = ParsedMetadata::default();
        for file in object_files(tree) {
            let content = match read_lossy(&file) {
                Ok(content) => content,
                Err(e) => {
                    warn!("Skipping unreadable source file: {:#}", e);
                    continue;
                }
            };
            for unit in object_units(&file, &content) {
                match parse_object_definition(unit) {
                    Some(ObjectDefinition::Unit(record)) => parsed.objects.push(record),
                    Some(ObjectDefinition::Document(doc)) => parsed.merge(doc),
                    None => debug!("No object declaration in {}", file.display()),
                }
            }
        }
        Ok(parsed)
    }
}

/// Parser strategies in priority order
pub fn default_parsers() -> Vec<Box<dyn MetadataParser>> {
    vec![Box::new(StructuredDocumentParser), Box::new(SourceTextParser)]
}

/// Procedure lists for every object declared under `tree`, keyed `type:name`.
pub fn collect_procedures(tree: &Path) -> BTreeMap<String, Vec<ProcedureRecord>> {
    let mut procedures = BTreeMap::new();
    for file in object_files(tree) {
        let Ok(content) = read_lossy(&file) else {
            continue;
        };
        for unit in object_units(&file, &content) {
            if let Some(ObjectDefinition::Unit(record)) = parse_object_definition(unit) {
                let list = extract_procedures(unit, record.kind, &record.name);
                procedures.insert(procedure_key(record.kind, &record.name), list);
            }
        }
    }
    procedures
}

/// `.al` sources plus `.txt` files that may be C/AL exports, sorted.
pub fn object_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && (is_source_file(e.path()) || is_legacy_export(e.path())))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

fn is_legacy_export(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(LEGACY_EXPORT_EXTENSION))
}

/// Object units in one file. A `.txt` export may hold many objects back to
/// back; other `.txt` files hold none.
fn object_units<'a>(path: &Path, content: &'a str) -> Vec<&'a str> {
    if is_source_file(path) {
        vec![content]
    } else if is_legacy_dialect(content) {
        legacy::split_objects(content)
    } else {
        Vec::new()
    }
}

/// Every `.al` file below `root`, sorted for stable output.
pub fn source_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_source_file(e.path()))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

pub fn is_source_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(SOURCE_EXTENSION))
}

pub(crate) fn read_lossy(path: &Path) -> anyhow::Result<String> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let text = String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned());
    Ok(text.trim_start_matches('\u{feff}').to_string())
}

/// Result of [`parse_object_definition`]
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectDefinition {
    /// A structured metadata document describing many objects
    Document(ParsedMetadata),
    /// A single source unit
    Unit(ObjectRecord),
}

/// Recognize either a structured metadata document or a single source unit.
/// `None` is a parse miss, not an error.
pub fn parse_object_definition(text: &str) -> Option<ObjectDefinition> {
    let text = text.trim_start_matches('\u{feff}');
    if text.trim_start().starts_with('{') {
        return parse_symbol_document(text).map(ObjectDefinition::Document);
    }
    if is_legacy_dialect(text) {
        let object = legacy::parse_legacy_object(text)?;
        return legacy_record(&object).map(ObjectDefinition::Unit);
    }
    parse_modern_unit(text).map(ObjectDefinition::Unit)
}

/// Declaration line of a modern source unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub kind: ObjectKind,
    pub id: Option<i64>,
    pub name: String,
    pub extends: Option<String>,
    /// Byte offset just past the declaration match
    pub end: usize,
}

/// Declaration that opens the unit. Only the first token after any
/// `namespace`/`using` statements and preprocessor lines is considered, so a
/// unit of an unknown kind yields `None` rather than a match from its body.
/// Comments must already be stripped.
pub fn declaration(text: &str) -> Option<Declaration> {
    let start = preamble_end(text);
    let caps = DECLARATION.captures(&text[start..])?;
    Some(Declaration {
        kind: ObjectKind::parse(&caps[1])?,
        id: caps.get(2).and_then(|m| m.as_str().parse().ok()),
        name: unquote(&caps[3]),
        extends: caps.get(4).map(|m| unquote(m.as_str())),
        end: start + caps.get(0)?.end(),
    })
}

fn starts_with_keyword(text: &str, keyword: &str) -> bool {
    text.get(..keyword.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(keyword))
        && text[keyword.len()..].starts_with(char::is_whitespace)
}

fn preamble_end(text: &str) -> usize {
    let mut pos = 0;
    loop {
        let rest = &text[pos..];
        let trimmed = rest.trim_start();
        let start = pos + (rest.len() - trimmed.len());
        let terminator = if trimmed.starts_with('#') {
            '\n'
        } else if starts_with_keyword(trimmed, "namespace") || starts_with_keyword(trimmed, "using") {
            ';'
        } else {
            return start;
        };
        match trimmed.find(terminator) {
            Some(idx) => pos = start + idx + 1,
            None => return text.len(),
        }
    }
}

/// Field names declared with `field(<id>; <name>; ...)`
pub fn field_names(text: &str) -> Vec<String> {
    FIELD.captures_iter(text).map(|c| unquote(&c[1])).collect()
}

/// Value of the object-level `SourceTable` property
pub fn source_table(text: &str) -> Option<String> {
    SOURCE_TABLE.captures(&object_level_text(text)).map(|c| unquote(&c[1]))
}

/// Strip surrounding double quotes and unescape `""`.
pub fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    match raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => raw.to_string(),
    }
}

/// Text at brace depth 1 of the first block, i.e. the object's own properties
/// without nested sections.
fn object_level_text(text: &str) -> String {
    let mut depth = 0usize;
    let mut out = String::new();
    for (_, c, state) in Scanner::new(text, 0, ScanMode::AL) {
        if state == ScanState::Normal {
            match c {
                '{' => {
                    depth += 1;
                    continue;
                }
                '}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        break;
                    }
                    continue;
                }
                _ => {}
            }
        }
        if depth == 1 {
            out.push(c);
        }
    }
    out
}

fn parse_modern_unit(text: &str) -> Option<ObjectRecord> {
    let stripped = strip_comments(text, ScanMode::AL);
    let decl = declaration(&stripped)?;
    let mut record = ObjectRecord::new(decl.kind, decl.id, decl.name.clone());
    let body = &stripped[decl.end..];

    if let Some(target) = &decl.extends {
        record = record.with_meta("extends", target.as_str());
    }
    if let Some(caption) = CAPTION.captures(&object_level_text(body)) {
        record = record.with_meta("caption", caption[1].replace("''", "'"));
    }
    match decl.kind {
        ObjectKind::Table | ObjectKind::TableExtension => {
            let fields = field_names(body);
            if !fields.is_empty() {
                record = record.with_meta("fields", fields);
            }
        }
        ObjectKind::Page => {
            if let Some(table) = source_table(body) {
                record = record.with_meta("sourceTable", table);
            }
        }
        ObjectKind::Report | ObjectKind::ReportExtension => match locate_block(body, "dataset", ScanMode::AL) {
            BlockLookup::Found(span) => {
                let items: Vec<String> = DATA_ITEM
                    .captures_iter(span.inner(body))
                    .map(|c| unquote(&c[1]))
                    .collect();
                record = record.with_meta("dataItems", items);
            }
            BlockLookup::Malformed { .. } => {
                warn!("Dataset block of {} '{}' has unbalanced braces", decl.kind, decl.name)
            }
            BlockLookup::Missing => {}
        },
        _ => {}
    }
    Some(record)
}

fn legacy_record(object: &LegacyObject) -> Option<ObjectRecord> {
    let kind = object.kind()?;
    let mut record = ObjectRecord::new(kind, Some(object.id), object.name.clone()).with_meta("legacy", true);
    if let Some(caption) = object.property("CaptionML") {
        record = record.with_meta("caption", caption);
    }
    if let Some(table) = object.property("SourceTable") {
        record = record.with_meta("sourceTable", table);
    }
    if let Some(version) = object
        .object_properties
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case("Version List"))
    {
        record = record.with_meta("versionList", version.value.as_str());
    }
    if !object.fields.is_empty() {
        let fields: Vec<&str> = object.fields.iter().map(|f| f.name.as_str()).collect();
        record = record.with_meta("fields", fields);
    }
    Some(record)
}

struct OpenProcedure {
    name: String,
    params: String,
    closed: bool,
    return_type: Option<String>,
}

impl OpenProcedure {
    fn new(name: String) -> Self {
        Self {
            name,
            params: String::new(),
            closed: false,
            return_type: None,
        }
    }

    /// Append header text until the parameter list's closing parenthesis.
    fn feed(&mut self, text: &str) {
        match closing_paren(text) {
            Some(idx) => {
                self.push_params(&text[..idx]);
                self.closed = true;
                self.return_type = return_type(&text[idx + 1..]);
            }
            None => self.push_params(text),
        }
    }

    fn push_params(&mut self, text: &str) {
        if !self.params.is_empty() {
            self.params.push(' ');
        }
        self.params.push_str(text.trim());
    }

    fn finish(self) -> ProcedureRecord {
        ProcedureRecord {
            name: self.name,
            parameters: self
                .params
                .split(';')
                .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
                .filter(|p| !p.is_empty())
                .collect(),
            return_type: self.return_type,
        }
    }
}

/// Index of the `)` closing a parameter list, ignoring quoted text and nested
/// parentheses.
fn closing_paren(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (idx, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') if depth == 0 => return Some(idx),
            (None, ')') => depth -= 1,
            _ => {}
        }
    }
    None
}

/// `: Type;` or `Name: Type;` after the parameter list
fn return_type(rest: &str) -> Option<String> {
    let (_, ty) = rest.split_once(':')?;
    let ty = ty.trim();
    let ty = ty.split(';').next().unwrap_or(ty).trim();
    if ty.is_empty() {
        None
    } else {
        Some(ty.split_whitespace().collect::<Vec<_>>().join(" "))
    }
}

/// Exported procedures of one source unit, in declaration order.
///
/// Headers carrying a `local` modifier are skipped. A header that never closes
/// its parameter list is ended by the next header or the end of the text.
pub fn extract_procedures(text: &str, kind: ObjectKind, name: &str) -> Vec<ProcedureRecord> {
    let stripped = if is_legacy_dialect(text) {
        // procedures live in the CODE section, where braces delimit comments
        match legacy::parse_legacy_object(text).and_then(|o| o.code) {
            Some(code) => strip_comments(&code, ScanMode::LEGACY_CODE),
            None => return Vec::new(),
        }
    } else {
        strip_comments(text, ScanMode::AL)
    };

    let mut procedures = Vec::new();
    let mut current: Option<OpenProcedure> = None;
    for line in stripped.lines() {
        if let Some(caps) = PROCEDURE_HEADER.captures(line) {
            if let Some(open) = current.take() {
                procedures.push(open.finish());
            }
            let modifiers = caps.get(1).map_or("", |m| m.as_str());
            if modifiers
                .split_whitespace()
                .any(|m| m.eq_ignore_ascii_case("local"))
            {
                continue;
            }
            let mut open = OpenProcedure::new(unquote(&caps[2]));
            open.feed(&caps[3]);
            current = Some(open);
        } else if let Some(open) = current.as_mut().filter(|o| !o.closed) {
            open.feed(line);
        }
    }
    if let Some(open) = current {
        procedures.push(open.finish());
    }

    debug!("Extracted {} procedures from {} '{}'", procedures.len(), kind, name);
    procedures
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SymbolContainer {
    tables: Vec<SymbolObject>,
    table_extensions: Vec<SymbolObject>,
    pages: Vec<SymbolObject>,
    page_extensions: Vec<SymbolObject>,
    reports: Vec<SymbolObject>,
    report_extensions: Vec<SymbolObject>,
    codeunits: Vec<SymbolObject>,
    queries: Vec<SymbolObject>,
    xml_ports: Vec<SymbolObject>,
    enum_types: Vec<SymbolObject>,
    enum_extension_types: Vec<SymbolObject>,
    interfaces: Vec<SymbolObject>,
    namespaces: Vec<SymbolContainer>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SymbolObject {
    id: Option<i64>,
    name: Option<String>,
    target_object: Option<String>,
    properties: Vec<SymbolProperty>,
    fields: Vec<SymbolField>,
    methods: Vec<SymbolMethod>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SymbolProperty {
    name: String,
    value: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SymbolField {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SymbolMethod {
    name: String,
    parameters: Vec<SymbolParameter>,
    return_type_definition: Option<Value>,
    is_local: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SymbolParameter {
    name: String,
    is_var: bool,
    type_definition: Option<Value>,
}

impl SymbolContainer {
    fn groups(&self) -> [(ObjectKind, &[SymbolObject]); 12] {
        [
            (ObjectKind::Table, self.tables.as_slice()),
            (ObjectKind::TableExtension, self.table_extensions.as_slice()),
            (ObjectKind::Page, self.pages.as_slice()),
            (ObjectKind::PageExtension, self.page_extensions.as_slice()),
            (ObjectKind::Report, self.reports.as_slice()),
            (ObjectKind::ReportExtension, self.report_extensions.as_slice()),
            (ObjectKind::Codeunit, self.codeunits.as_slice()),
            (ObjectKind::Query, self.queries.as_slice()),
            (ObjectKind::XmlPort, self.xml_ports.as_slice()),
            (ObjectKind::Enum, self.enum_types.as_slice()),
            (ObjectKind::EnumExtension, self.enum_extension_types.as_slice()),
            (ObjectKind::Interface, self.interfaces.as_slice()),
        ]
    }

    fn collect_into(&self, out: &mut ParsedMetadata) {
        for (kind, objects) in self.groups() {
            for object in objects {
                let Some(name) = object.name.as_deref().filter(|n| !n.is_empty()) else {
                    continue;
                };
                out.objects.push(symbol_record(kind, name, object));
                if !object.methods.is_empty() {
                    let procedures = object
                        .methods
                        .iter()
                        .filter(|m| !m.is_local)
                        .map(method_record)
                        .collect();
                    out.procedures.insert(procedure_key(kind, name), procedures);
                }
            }
        }
        for namespace in &self.namespaces {
            namespace.collect_into(out);
        }
    }
}

/// Parse a `SymbolReference.json` style document. `None` when the text is
/// not JSON or declares no objects at all.
pub fn parse_symbol_document(text: &str) -> Option<ParsedMetadata> {
    let container: SymbolContainer = match serde_json::from_str(text.trim_start_matches('\u{feff}')) {
        Ok(container) => container,
        Err(e) => {
            debug!("Not a symbol document: {}", e);
            return None;
        }
    };
    let mut parsed = ParsedMetadata::default();
    container.collect_into(&mut parsed);
    if parsed.objects.is_empty() {
        None
    } else {
        Some(parsed)
    }
}

fn symbol_record(kind: ObjectKind, name: &str, object: &SymbolObject) -> ObjectRecord {
    let mut record = ObjectRecord::new(kind, object.id, name);
    if let Some(target) = &object.target_object {
        record = record.with_meta("extends", target.as_str());
    }
    for property in &object.properties {
        let key = match property.name.as_str() {
            "Caption" => "caption",
            "SourceTable" => "sourceTable",
            _ => continue,
        };
        let value = match &property.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        record = record.with_meta(key, value);
    }
    if !object.fields.is_empty() {
        let fields: Vec<&str> = object.fields.iter().map(|f| f.name.as_str()).collect();
        record = record.with_meta("fields", fields);
    }
    record
}

fn method_record(method: &SymbolMethod) -> ProcedureRecord {
    ProcedureRecord {
        name: method.name.clone(),
        parameters: method
            .parameters
            .iter()
            .map(|p| {
                let ty = p.type_definition.as_ref().and_then(format_type).unwrap_or_default();
                let var = if p.is_var { "var " } else { "" };
                format!("{}{}: {}", var, quote_identifier(&p.name), ty).trim_end_matches([':', ' ']).to_string()
            })
            .collect(),
        return_type: method.return_type_definition.as_ref().and_then(format_type),
    }
}

/// `Record "Sales Header" temporary` from a type definition object
fn format_type(definition: &Value) -> Option<String> {
    let name = definition.get("Name")?.as_str()?;
    let mut out = name.to_string();
    if let Some(sub) = definition
        .get("Subtype")
        .and_then(|s| s.get("Name"))
        .and_then(Value::as_str)
    {
        out.push(' ');
        out.push_str(&quote_identifier(sub));
    }
    if definition.get("Temporary").and_then(Value::as_bool) == Some(true) {
        out.push_str(" temporary");
    }
    Some(out)
}

fn quote_identifier(name: &str) -> String {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}
