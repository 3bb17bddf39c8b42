//! Structural parser for legacy C/AL object text.
//!
//! A C/AL export is an `OBJECT <type> <id> <name>` header followed by a brace
//! delimited body of named sections (`OBJECT-PROPERTIES`, `PROPERTIES`, `FIELDS`,
//! `KEYS`, `CONTROLS`, `CODE`, ...). Sections we understand are parsed into
//! records; everything else is kept verbatim so [`LegacyObject::reconstruct`] can
//! write the object back with minimal diff noise.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::scanner::{keyword_positions, locate_block, locate_block_with, top_level_records, BlockLookup, ScanMode};
use crate::index::ObjectKind;

static HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*OBJECT[ \t]+([A-Za-z]+)[ \t]+(\d+)[ \t]+(.+?)[ \t\r]*$")
        .expect("legacy header pattern is valid")
});

const SECTION_KEYWORDS: [&str; 5] = ["OBJECT-PROPERTIES", "PROPERTIES", "FIELDS", "CONTROLS", "CODE"];

/// Plain `Key=Value` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegacyProperty {
    pub name: String,
    pub value: String,
}

/// `On...` property whose value is a `BEGIN ... END;` (or `VAR ... END;`) body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegacyTrigger {
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyField {
    pub id: Option<i64>,
    pub name: String,
    pub data_type: String,
    pub properties: Vec<LegacyProperty>,
    pub triggers: Vec<LegacyTrigger>,
    /// The record exactly as it appeared, from `{` through `}`
    pub original_text: String,
    #[serde(skip)]
    leading: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyControl {
    pub id: Option<i64>,
    pub indentation: Option<u32>,
    #[serde(rename = "type")]
    pub control_type: String,
    pub properties: Vec<LegacyProperty>,
    pub triggers: Vec<LegacyTrigger>,
    pub source_expr: Option<String>,
    pub original_text: String,
    #[serde(skip)]
    leading: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyAction {
    pub id: Option<i64>,
    pub level: Option<u32>,
    #[serde(rename = "type")]
    pub action_type: String,
    pub properties: Vec<LegacyProperty>,
    pub triggers: Vec<LegacyTrigger>,
    pub original_text: String,
    #[serde(skip)]
    leading: String,
}

/// A section as written in the source: keyword casing and body kept verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
struct RawSection {
    keyword: String,
    inner: String,
}

/// Parsed C/AL object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyObject {
    pub object_type: String,
    pub id: i64,
    pub name: String,
    pub object_properties: Vec<LegacyProperty>,
    pub properties: Vec<LegacyProperty>,
    pub triggers: Vec<LegacyTrigger>,
    pub fields: Vec<LegacyField>,
    pub controls: Vec<LegacyControl>,
    pub actions: Vec<LegacyAction>,
    /// Body of the `CODE` section with the documentation trailer removed
    pub code: Option<String>,
    /// Contents of the `BEGIN { ... } END.` trailer
    pub documentation: Option<String>,
    /// Sections whose braces never balanced
    pub malformed_sections: Vec<String>,
    #[serde(skip)]
    sections: Vec<RawSection>,
    #[serde(skip)]
    unparsed_tail: Option<String>,
}

/// Inclusive id range used by [`LegacyObject::filter_by_id_ranges`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IdRange {
    pub from: i64,
    pub to: i64,
}

impl IdRange {
    pub fn new(from: i64, to: i64) -> Self {
        Self {
            from: from.min(to),
            to: from.max(to),
        }
    }

    pub fn contains(&self, id: i64) -> bool {
        (self.from..=self.to).contains(&id)
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from, self.to)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid id range '{0}', expected FROM..TO, FROM-TO or a single id")]
pub struct ParseIdRangeError(String);

impl FromStr for IdRange {
    type Err = ParseIdRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let err = || ParseIdRangeError(s.to_string());
        let (from, to) = match s.split_once("..").or_else(|| s.split_once('-')) {
            Some((a, b)) => (a.trim(), b.trim()),
            None => (s, s),
        };
        let from: i64 = from.parse().map_err(|_| err())?;
        let to: i64 = to.parse().map_err(|_| err())?;
        Ok(IdRange::new(from, to))
    }
}

/// Cheap check for C/AL export text: an `OBJECT` header plus at least one
/// section keyword standing on its own line.
pub fn is_legacy_dialect(text: &str) -> bool {
    if !HEADER.is_match(text) {
        return false;
    }
    text.lines()
        .map(str::trim)
        .any(|line| SECTION_KEYWORDS.contains(&line))
}

/// Split an export holding several objects at each `OBJECT` header.
pub fn split_objects(text: &str) -> Vec<&str> {
    let starts: Vec<usize> = HEADER.find_iter(text).map(|m| m.start()).collect();
    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| &text[start..starts.get(i + 1).copied().unwrap_or(text.len())])
        .collect()
}

/// Parse a C/AL object. `None` when there is no `OBJECT` header.
pub fn parse_legacy_object(text: &str) -> Option<LegacyObject> {
    let header = HEADER.captures(text)?;
    let whole = header.get(0)?;
    let mut object = LegacyObject {
        object_type: header[1].to_string(),
        id: header[2].parse().ok()?,
        name: header[3].trim().to_string(),
        object_properties: Vec::new(),
        properties: Vec::new(),
        triggers: Vec::new(),
        fields: Vec::new(),
        controls: Vec::new(),
        actions: Vec::new(),
        code: None,
        documentation: None,
        malformed_sections: Vec::new(),
        sections: Vec::new(),
        unparsed_tail: None,
    };

    let Some(rel) = text[whole.end()..].find('{') else {
        return Some(object);
    };
    object.walk_sections(text, whole.end() + rel + 1);

    for section in object.sections.clone() {
        match section.keyword.to_ascii_uppercase().as_str() {
            "OBJECT-PROPERTIES" => {
                let (props, _) = parse_property_list_at(&section.inner, 0);
                object.object_properties = props;
            }
            "PROPERTIES" => {
                let (props, triggers) = parse_property_list_at(&section.inner, 0);
                object.properties = props;
                object.triggers = triggers;
                object.actions = parse_actions(&section.inner);
            }
            "FIELDS" => object.fields = parse_fields(&section.inner),
            "CONTROLS" => object.controls = parse_controls(&section.inner),
            "CODE" => {
                let (code, documentation) = split_code(&section.inner);
                object.code = Some(code);
                object.documentation = documentation;
            }
            _ => {}
        }
    }

    debug!(
        "Parsed legacy {} {} '{}': {} fields, {} controls, {} actions",
        object.object_type,
        object.id,
        object.name,
        object.fields.len(),
        object.controls.len(),
        object.actions.len()
    );
    Some(object)
}

impl LegacyObject {
    pub fn kind(&self) -> Option<ObjectKind> {
        ObjectKind::parse(&self.object_type)
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.value.as_str())
    }

    fn walk_sections(&mut self, text: &str, body_start: usize) {
        let mut cursor = body_start;
        loop {
            let rest = &text[cursor..];
            let skipped = rest.len() - rest.trim_start().len();
            cursor += skipped;
            let rest = &text[cursor..];
            if rest.is_empty() || rest.starts_with('}') {
                return;
            }

            let word_len = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
                .unwrap_or(rest.len());
            let keyword = &rest[..word_len];
            let after = rest[word_len..].trim_start();
            if keyword.is_empty() || !after.starts_with('{') {
                self.unparsed_tail = Some(rest.trim_end().to_string());
                return;
            }

            let body_mode = if keyword.eq_ignore_ascii_case("CODE") {
                ScanMode::LEGACY_CODE
            } else {
                ScanMode::STRUCTURE
            };
            match locate_block_with(text, cursor, keyword, ScanMode::STRUCTURE, body_mode) {
                BlockLookup::Found(span) if span.keyword_start == cursor => {
                    self.sections.push(RawSection {
                        keyword: keyword.to_string(),
                        inner: span.inner(text).to_string(),
                    });
                    cursor = span.close + 1;
                }
                BlockLookup::Malformed { .. } => {
                    warn!("Section {} of {} '{}' has unbalanced braces", keyword, self.object_type, self.name);
                    self.malformed_sections.push(keyword.to_string());
                    self.unparsed_tail = Some(rest.trim_end().to_string());
                    return;
                }
                _ => {
                    self.unparsed_tail = Some(rest.trim_end().to_string());
                    return;
                }
            }
        }
    }

    /// Keep only fields, controls and actions whose id lies inside one of
    /// `ranges`. Records without a numeric id are kept.
    pub fn filter_by_id_ranges(&mut self, ranges: &[IdRange]) {
        let keep = |id: Option<i64>| id.map_or(true, |id| ranges.iter().any(|r| r.contains(id)));
        self.fields.retain(|f| keep(f.id));
        self.controls.retain(|c| keep(c.id));
        self.actions.retain(|a| keep(a.id));
    }

    /// Write the object back in C/AL export layout. Sections keep their
    /// original text except for the record lists, which are rebuilt from the
    /// retained records' original text.
    pub fn reconstruct(&self) -> String {
        let mut out = format!("OBJECT {} {} {}\n{{\n", self.object_type, self.id, self.name);

        for section in &self.sections {
            let inner = match section.keyword.to_ascii_uppercase().as_str() {
                "FIELDS" => render_records(self.fields.iter().map(|f| (&f.leading, &f.original_text)), "  "),
                "CONTROLS" => {
                    render_records(self.controls.iter().map(|c| (&c.leading, &c.original_text)), "  ")
                }
                "PROPERTIES" => self.splice_actions(&section.inner),
                "CODE" => match &self.documentation {
                    Some(doc) => format!(
                        "{}BEGIN\n    {{{}}}\n    END.\n  ",
                        self.code.as_deref().unwrap_or_default(),
                        doc
                    ),
                    None => self.code.clone().unwrap_or_else(|| section.inner.clone()),
                },
                _ => section.inner.clone(),
            };
            out.push_str(&format!("  {}\n  {{{}}}\n", section.keyword, inner));
        }

        if let Some(tail) = &self.unparsed_tail {
            out.push_str(tail);
            out.push('\n');
        } else {
            out.push_str("}\n");
        }
        out
    }

    fn splice_actions(&self, properties_text: &str) -> String {
        let Some(span) = locate_block(properties_text, "ACTIONS", ScanMode::STRUCTURE).span() else {
            return properties_text.to_string();
        };
        let closing_indent = line_indent_before(properties_text, span.close);
        let rebuilt = render_records(
            self.actions.iter().map(|a| (&a.leading, &a.original_text)),
            &closing_indent,
        );
        format!(
            "{}{}{}",
            &properties_text[..span.open + 1],
            rebuilt,
            &properties_text[span.close..]
        )
    }
}

fn render_records<'a>(records: impl Iterator<Item = (&'a String, &'a String)>, closing_indent: &str) -> String {
    let mut inner = String::from("\n");
    for (leading, text) in records {
        inner.push_str(leading);
        inner.push_str(text);
        inner.push('\n');
    }
    inner.push_str(closing_indent);
    inner
}

/// Whitespace between the start of the line holding `idx` and `idx`, if that
/// prefix is all whitespace.
fn line_indent_before(text: &str, idx: usize) -> String {
    let line_start = text[..idx].rfind('\n').map_or(0, |p| p + 1);
    let prefix = &text[line_start..idx];
    if prefix.chars().all(char::is_whitespace) {
        prefix.to_string()
    } else {
        String::new()
    }
}

fn column_of(text: &str, idx: usize) -> usize {
    let line_start = text[..idx].rfind('\n').map_or(0, |p| p + 1);
    text[line_start..idx].chars().count()
}

fn indent_width(line: &str) -> usize {
    line.chars().take_while(|c| *c == ' ' || *c == '\t').count()
}

/// Split a record `{ a ; b ; ... }` into at most `parts` trimmed columns, the
/// last of which keeps any further `;`. Also returns the byte offset of the last
/// column inside `record`.
fn split_record(record: &str, parts: usize) -> (Vec<&str>, usize) {
    let body = &record[1..record.len() - 1];
    let mut columns = Vec::with_capacity(parts);
    let mut offset = 1;
    let mut last_start = 1;
    for (i, column) in body.splitn(parts, ';').enumerate() {
        if i == parts - 1 {
            last_start = offset;
        }
        columns.push(column);
        offset += column.len() + 1;
    }
    (columns, last_start)
}

struct RecordText<'a> {
    text: &'a str,
    leading: String,
    columns: Vec<&'a str>,
    props_col: usize,
}

fn records(section: &str, parts: usize) -> Vec<RecordText<'_>> {
    top_level_records(section, ScanMode::STRUCTURE)
        .into_iter()
        .map(|(open, close)| {
            let text = &section[open..=close];
            let (columns, last_start) = split_record(text, parts);
            RecordText {
                text,
                leading: line_indent_before(section, open),
                props_col: column_of(section, open + last_start),
                columns,
            }
        })
        .collect()
}

fn parse_fields(section: &str) -> Vec<LegacyField> {
    records(section, 5)
        .into_iter()
        .filter(|r| r.columns.len() >= 4)
        .map(|r| {
            let (properties, triggers) = r
                .columns
                .get(4)
                .map(|props| parse_property_list_at(props, r.props_col))
                .unwrap_or_default();
            LegacyField {
                id: r.columns[0].trim().parse().ok(),
                name: r.columns[2].trim().to_string(),
                data_type: r.columns[3].trim().to_string(),
                properties,
                triggers,
                original_text: r.text.to_string(),
                leading: r.leading,
            }
        })
        .collect()
}

fn parse_controls(section: &str) -> Vec<LegacyControl> {
    records(section, 4)
        .into_iter()
        .filter(|r| r.columns.len() >= 3)
        .map(|r| {
            let (properties, triggers) = r
                .columns
                .get(3)
                .map(|props| parse_property_list_at(props, r.props_col))
                .unwrap_or_default();
            let source_expr = properties
                .iter()
                .find(|p| p.name.eq_ignore_ascii_case("SourceExpr"))
                .map(|p| p.value.clone());
            LegacyControl {
                id: r.columns[0].trim().parse().ok(),
                indentation: r.columns[1].trim().parse().ok(),
                control_type: r.columns[2].trim().to_string(),
                properties,
                triggers,
                source_expr,
                original_text: r.text.to_string(),
                leading: r.leading,
            }
        })
        .collect()
}

/// Records of the `ActionList=ACTIONS { ... }` block inside `PROPERTIES`
fn parse_actions(properties_text: &str) -> Vec<LegacyAction> {
    let span = match locate_block(properties_text, "ACTIONS", ScanMode::STRUCTURE) {
        BlockLookup::Found(span) => span,
        BlockLookup::Malformed { .. } => {
            warn!("ACTIONS block has unbalanced braces");
            return Vec::new();
        }
        BlockLookup::Missing => return Vec::new(),
    };
    let inner = span.inner(properties_text);
    records(inner, 4)
        .into_iter()
        .filter(|r| r.columns.len() >= 3)
        .map(|r| {
            let (properties, triggers) = r
                .columns
                .get(3)
                .map(|props| parse_property_list_at(props, r.props_col))
                .unwrap_or_default();
            LegacyAction {
                id: r.columns[0].trim().parse().ok(),
                level: r.columns[1].trim().parse().ok(),
                action_type: r.columns[2].trim().to_string(),
                properties,
                triggers,
                original_text: r.text.to_string(),
                leading: r.leading,
            }
        })
        .collect()
}

fn starts_with_word(text: &str, word: &str) -> bool {
    text.get(..word.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(word))
        && !text[word.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_end_line(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case("END;")
}

/// Index of the line closing a trigger that starts on `start`. The closing
/// `END;` normally sits at the same column as the opening keyword.
fn trigger_end(lines: &[&str], start: usize, value_col: usize) -> usize {
    let later = || lines.iter().enumerate().skip(start + 1);
    later()
        .find(|(_, l)| is_end_line(l) && indent_width(l) == value_col)
        .or_else(|| later().find(|(_, l)| is_end_line(l) && indent_width(l) <= value_col))
        .map_or(lines.len().saturating_sub(1), |(i, _)| i)
}

fn depth_delta(line: &str) -> i32 {
    line.chars()
        .map(|c| match c {
            '[' | '{' => 1,
            ']' | '}' => -1,
            _ => 0,
        })
        .sum()
}

/// Parse `Key=Value;` lines. `first_col` is the column at which the first line
/// of `text` starts in the original document, needed to line up trigger ends.
fn parse_property_list_at(text: &str, first_col: usize) -> (Vec<LegacyProperty>, Vec<LegacyTrigger>) {
    let lines: Vec<&str> = text.split('\n').map(|l| l.trim_end_matches('\r')).collect();
    let mut properties = Vec::new();
    let mut triggers = Vec::new();

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let Some(eq) = line.find('=') else {
            i += 1;
            continue;
        };
        let key = line[..eq].trim();
        if key.is_empty() || key.contains(['{', '}', ';']) {
            i += 1;
            continue;
        }
        let value_part = &line[eq + 1..];
        let value = value_part.trim_start();
        let base = if i == 0 { first_col } else { 0 };
        let value_col = base + line[..eq + 1].chars().count() + (value_part.chars().count() - value.chars().count());

        let is_trigger = key.len() > 2
            && key.starts_with("On")
            && (starts_with_word(value, "BEGIN") || starts_with_word(value, "VAR"));
        if is_trigger {
            let end = if value.trim_end().to_ascii_uppercase().ends_with("END;") {
                i
            } else {
                trigger_end(&lines, i, value_col)
            };
            let mut code = value.to_string();
            for l in &lines[i + 1..=end] {
                code.push('\n');
                code.push_str(l);
            }
            triggers.push(LegacyTrigger {
                name: key.to_string(),
                code: code.trim_end().to_string(),
            });
            i = end + 1;
            continue;
        }

        let mut accumulated = value.to_string();
        let mut depth = depth_delta(value);
        let mut opened = value.contains('{');
        let mut j = i;
        loop {
            let tail = accumulated.trim_end();
            let complete = depth <= 0 && (tail.ends_with(';') || (opened && tail.ends_with('}')));
            if complete || j + 1 >= lines.len() {
                break;
            }
            j += 1;
            accumulated.push('\n');
            accumulated.push_str(lines[j]);
            depth += depth_delta(lines[j]);
            opened |= lines[j].contains('{');
        }
        let trimmed = accumulated.trim_end();
        let trimmed = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end();
        properties.push(LegacyProperty {
            name: key.to_string(),
            value: trimmed.to_string(),
        });
        i = j + 1;
    }

    (properties, triggers)
}

/// Split a `CODE` body into code and the documentation trailer
/// `BEGIN { ... } END.`.
fn split_code(inner: &str) -> (String, Option<String>) {
    let Some(&begin) = keyword_positions(inner, "BEGIN", ScanMode::LEGACY_CODE).last() else {
        return (inner.to_string(), None);
    };
    let after = &inner[begin + "BEGIN".len()..];
    let trimmed = after.trim_start();
    if !trimmed.starts_with('{') {
        return (inner.to_string(), None);
    }
    let Some(close) = trimmed.find('}') else {
        return (inner.to_string(), None);
    };
    if !starts_with_word(trimmed[close + 1..].trim_start(), "END") {
        return (inner.to_string(), None);
    }
    (inner[..begin].to_string(), Some(trimmed[1..close].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "OBJECT Table 50000 Sales Extra
{
  OBJECT-PROPERTIES
  {
    Date=01.02.18;
    Time=12:00:00;
    Version List=EXT1.00;
  }
  PROPERTIES
  {
    DataCaptionFields=No.;
    OnInsert=BEGIN
               IF \"No.\" = '' THEN
                 ERROR('{ no number }');
             END;

  }
  FIELDS
  {
    { 10  ;   ;No.                 ;Code20        ;CaptionML=ENU=No. }
    { 60000;  ;Extra Note          ;Text50        ;OnValidate=BEGIN
                                                                TESTFIELD(\"No.\");
                                                              END;
                                                               }
  }
  KEYS
  {
    {    ;No.                                     ;Clustered=Yes }
  }
  CODE
  {

    BEGIN
    {
      Changed for EXT1.00
    }
    END.
  }
}
";

    const PAGE: &str = "OBJECT Page 50010 Extra Card
{
  OBJECT-PROPERTIES
  {
    Date=01.02.18;
  }
  PROPERTIES
  {
    SourceTable=Table50000;
    PageType=Card;
    ActionList=ACTIONS
    {
      { 7       ;1   ;ActionGroup;
                      CaptionML=ENU=F&unctions }
      { 60001   ;2   ;Action    ;
                      CaptionML=ENU=Post;
                      OnAction=BEGIN
                                 MESSAGE('posted');
                               END;
                                }
    }
  }
  CONTROLS
  {
    { 1   ;0   ;Container ;
                ContainerType=ContentArea }
    { 60002;1  ;Field     ;
                SourceExpr=\"Extra Note\" }
  }
  CODE
  {

    BEGIN
    END.
  }
}
";

    #[test]
    fn test_header_and_object_properties() {
        let object = parse_legacy_object(TABLE).unwrap();
        assert_eq!(object.object_type, "Table");
        assert_eq!(object.id, 50000);
        assert_eq!(object.name, "Sales Extra");
        assert_eq!(object.kind(), Some(ObjectKind::Table));
        assert_eq!(object.object_properties.len(), 3);
        assert_eq!(object.object_properties[2].name, "Version List");
        assert_eq!(object.object_properties[2].value, "EXT1.00");
    }

    #[test]
    fn test_properties_and_triggers() {
        let object = parse_legacy_object(TABLE).unwrap();
        assert_eq!(object.property("DataCaptionFields"), Some("No."));
        assert_eq!(object.triggers.len(), 1);
        assert_eq!(object.triggers[0].name, "OnInsert");
        assert!(object.triggers[0].code.starts_with("BEGIN"));
        assert!(object.triggers[0].code.ends_with("END;"));
        assert!(object.triggers[0].code.contains("ERROR('{ no number }');"));
    }

    #[test]
    fn test_fields() {
        let object = parse_legacy_object(TABLE).unwrap();
        assert_eq!(object.fields.len(), 2);
        let first = &object.fields[0];
        assert_eq!(first.id, Some(10));
        assert_eq!(first.name, "No.");
        assert_eq!(first.data_type, "Code20");
        assert_eq!(first.properties[0].value, "ENU=No.");

        let second = &object.fields[1];
        assert_eq!(second.id, Some(60000));
        assert_eq!(second.triggers[0].name, "OnValidate");
        assert!(second.triggers[0].code.contains("TESTFIELD"));
        assert!(second.original_text.starts_with("{ 60000;"));
        assert!(second.original_text.ends_with('}'));
    }

    #[test]
    fn test_code_and_documentation() {
        let object = parse_legacy_object(TABLE).unwrap();
        assert_eq!(object.documentation.as_deref().map(str::trim), Some("Changed for EXT1.00"));
        assert!(!object.code.as_deref().unwrap().contains("BEGIN"));
    }

    #[test]
    fn test_unfiltered_reconstruction_is_identical() {
        let object = parse_legacy_object(TABLE).unwrap();
        assert_eq!(object.reconstruct(), TABLE);
        let page = parse_legacy_object(PAGE).unwrap();
        assert_eq!(page.reconstruct(), PAGE);
    }

    #[test]
    fn test_filter_keeps_only_range_fields_verbatim() {
        let mut object = parse_legacy_object(TABLE).unwrap();
        let original_60000 = object.fields[1].original_text.clone();
        object.filter_by_id_ranges(&[IdRange::new(60000, 69999)]);

        let out = object.reconstruct();
        assert!(out.contains(&original_60000));
        assert!(!out.contains("{ 10  ;"));
        assert!(out.contains("KEYS"));
        assert!(out.contains("Version List=EXT1.00;"));
    }

    #[test]
    fn test_page_controls_and_actions() {
        let mut page = parse_legacy_object(PAGE).unwrap();
        assert_eq!(page.property("SourceTable"), Some("Table50000"));
        assert_eq!(page.controls.len(), 2);
        assert_eq!(page.controls[1].source_expr.as_deref(), Some("\"Extra Note\""));
        assert_eq!(page.controls[0].control_type, "Container");
        assert_eq!(page.actions.len(), 2);
        assert_eq!(page.actions[1].level, Some(2));
        assert_eq!(page.actions[1].triggers[0].name, "OnAction");

        page.filter_by_id_ranges(&[IdRange::new(60000, 69999)]);
        let out = page.reconstruct();
        assert!(!out.contains("ActionGroup"));
        assert!(out.contains("MESSAGE('posted');"));
        assert!(!out.contains("ContainerType"));
        assert!(out.contains("SourceExpr=\"Extra Note\""));
    }

    #[test]
    fn test_empty_range_set_removes_all_records() {
        let mut object = parse_legacy_object(TABLE).unwrap();
        object.filter_by_id_ranges(&[]);
        assert!(object.fields.is_empty());
        assert!(object.reconstruct().contains("  FIELDS\n  {\n  }\n"));
    }

    #[test]
    fn test_malformed_section() {
        let text = "OBJECT Codeunit 50001 Broken\n{\n  PROPERTIES\n  {\n    OnRun=BEGIN\n";
        let object = parse_legacy_object(text).unwrap();
        assert_eq!(object.malformed_sections, vec!["PROPERTIES".to_string()]);
        assert!(object.reconstruct().contains("OnRun=BEGIN"));
    }

    #[test]
    fn test_dialect_detection() {
        assert!(is_legacy_dialect(TABLE));
        assert!(!is_legacy_dialect("table 50000 \"Sales Extra\"\n{\n    fields\n    {\n    }\n}"));
        assert!(parse_legacy_object("codeunit 50000 Foo { }").is_none());
    }

    #[test]
    fn test_id_range_parsing() {
        assert_eq!("60000..69999".parse::<IdRange>(), Ok(IdRange::new(60000, 69999)));
        assert_eq!("50000-50099".parse::<IdRange>(), Ok(IdRange::new(50000, 50099)));
        assert_eq!("7".parse::<IdRange>(), Ok(IdRange::new(7, 7)));
        assert!("a..b".parse::<IdRange>().is_err());
        assert!(IdRange::new(10, 1).contains(5));
    }
}
