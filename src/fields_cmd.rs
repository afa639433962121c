//! `jmirror discover-fields`: list the instance's custom fields and draft a
//! `[[custom_fields]]` section for the ones worth mirroring.

use std::path::Path;

use anyhow::{Context, Result};
use jira_mirror_core::fields::{is_valid_field_id, CustomFieldDef, FieldType};
use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::source::jira::{JiraSource, RemoteField};

/// Name fragments of fields that are usually worth searching by.
const RELEVANT_NAMES: &[&str] = &[
    "team",
    "component",
    "epic",
    "story",
    "points",
    "priority",
    "severity",
    "impact",
    "environment",
    "version",
    "product",
    "sprint",
    "fixversion",
    "affectedversion",
    "label",
];

pub fn is_relevant(name: &str) -> bool {
    let name = name.to_lowercase();
    RELEVANT_NAMES.iter().any(|k| name.contains(k))
}

/// Mirror type for a Jira schema type.
pub fn mirror_type(schema_type: &str) -> FieldType {
    match schema_type {
        "number" => FieldType::Number,
        "date" | "datetime" => FieldType::Date,
        _ => FieldType::Text,
    }
}

#[derive(Serialize)]
struct CustomFieldsSection<'a> {
    custom_fields: &'a [CustomFieldDef],
}

/// TOML for a `[[custom_fields]]` list, ready to append to a config file.
pub fn config_section(fields: &[CustomFieldDef]) -> Result<String> {
    toml::to_string(&CustomFieldsSection {
        custom_fields: fields,
    })
    .context("Failed to render custom field section")
}

fn definition(field: &RemoteField) -> CustomFieldDef {
    CustomFieldDef {
        id: field.id.clone(),
        name: field.name.clone(),
        field_type: mirror_type(field.value_type()),
    }
}

pub async fn run_discover_fields(
    config: &Config,
    filter: Option<&str>,
    output: Option<&Path>,
) -> Result<()> {
    let source = JiraSource::from_config(config)?;
    let mut fields = source.custom_fields().await?;
    if let Some(filter) = filter {
        let needle = filter.to_lowercase();
        fields.retain(|f| f.name.to_lowercase().contains(&needle));
    }

    if fields.is_empty() {
        println!("No custom fields found.");
        return Ok(());
    }

    println!("Found {} custom fields:", fields.len());
    println!();
    let mut relevant = Vec::new();
    for field in &fields {
        let hit = is_relevant(&field.name) && is_valid_field_id(&field.id);
        println!(
            "{} {:<20} {:<40} [{}]",
            if hit { "*" } else { " " },
            field.id,
            field.name,
            field.value_type()
        );
        if hit {
            relevant.push(definition(field));
        }
    }
    println!();
    println!("* likely useful for search ({} fields)", relevant.len());
    info!(found = fields.len(), relevant = relevant.len(), "discovered custom fields");

    let Some(output) = output else {
        return Ok(());
    };
    let section = config_section(&relevant)?;
    if output == Path::new("-") {
        println!();
        print!("{}", section);
    } else {
        std::fs::write(output, &section)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        println!(
            "Wrote {} field definitions to {}",
            relevant.len(),
            output.display()
        );
    }
    Ok(())
}
