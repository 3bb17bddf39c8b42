use anyhow::{Context, Result};

use super::Project;
use crate::index::field_cache::FieldIndex;
use crate::index::ObjectKind;
use crate::query::engine::QueryEngine;

fn parse_kind(kind: &str) -> Result<ObjectKind> {
    ObjectKind::parse(kind).with_context(|| format!("Unknown object type: {}", kind))
}

pub async fn query_index(
    query_type: String,
    target: String,
    kind: Option<String>,
    source: Option<String>,
    project: String,
    format: String,
) -> Result<()> {
    let project = Project::open(&project)?;
    let options = project.refresh_options();
    let store = project.open_store();
    let fields = FieldIndex::load(&options.cache_dir);
    let engine = QueryEngine::new(&store, &fields);

    let result = match query_type.as_str() {
        "object" => serde_json::to_value(engine.get_object_info(&target))?,
        "id" => serde_json::to_value(engine.get_object_id(&target))?,
        "procedures" => {
            let kind = parse_kind(kind.as_deref().context("--kind is required for procedure queries")?)?;
            serde_json::to_value(engine.get_procedures(kind, &target))?
        }
        "fields" => serde_json::to_value(engine.get_fields_for_table(&target))?,
        "source-table" => serde_json::to_value(engine.get_source_table(&target))?,
        "table-type" => {
            let path = source.context("--source is required for table-type queries")?;
            let text = std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path))?;
            serde_json::to_value(engine.guess_table_type(&text, &target))?
        }
        "search" => {
            let kind = kind.as_deref().map(parse_kind).transpose()?;
            serde_json::to_value(engine.search_objects(&target, kind, 50))?
        }
        _ => {
            anyhow::bail!("Unknown query type: {}", query_type);
        }
    };

    match format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        "text" => print_text(&query_type, &target, &result),
        _ => anyhow::bail!("Unknown format: {}", format),
    }
    Ok(())
}

fn print_text(query_type: &str, target: &str, result: &serde_json::Value) {
    match result {
        serde_json::Value::Null => println!("No {} result for '{}'", query_type, target),
        serde_json::Value::Array(items) if items.is_empty() => println!("No {} found for '{}'", query_type, target),
        serde_json::Value::Array(items) => {
            println!("Found {} results:", items.len());
            for item in items {
                match item {
                    serde_json::Value::String(s) => println!("  {}", s),
                    serde_json::Value::Object(o) => println!(
                        "  {} {} {}",
                        o.get("type").and_then(|v| v.as_str()).unwrap_or(""),
                        o.get("id").map(|v| v.to_string()).unwrap_or_default(),
                        o.get("name").and_then(|v| v.as_str()).unwrap_or("")
                    ),
                    other => println!("  {}", other),
                }
            }
        }
        serde_json::Value::String(s) => println!("{}", s),
        other => println!("{}", other),
    }
}
