//! Field catalog: the allow-list of queryable fields.
//!
//! Built-in fields are fixed; custom fields come from configuration and are
//! addressable by id (`customfield_10010`), by `cf[10010]`, or by their
//! configured name.

use serde::{Deserialize, Serialize};

/// Value type of a configured custom field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Text,
    Number,
    Date,
}

/// A custom field the mirror extracts and indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomFieldDef {
    /// Remote field id, e.g. `customfield_12313240`.
    pub id: String,
    /// Human name, usable in structured queries (`team = Platform`).
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
}

/// How a field compares, which decides the operators it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Key,
    Text,
    /// Identity-like: matches either the id or the display name.
    Identity,
    Enum,
    /// Multi-valued (labels, components).
    Multi,
    Date,
    Number,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Key,
    Project,
    Summary,
    Description,
    Comments,
    Status,
    Priority,
    Assignee,
    Reporter,
    IssueType,
    Labels,
    Components,
    Created,
    Updated,
    Custom { id: String, field_type: FieldType },
}

impl Field {
    pub fn kind(&self) -> FieldKind {
        match self {
            Field::Key => FieldKind::Key,
            Field::Project | Field::Assignee | Field::Reporter => FieldKind::Identity,
            Field::Summary | Field::Description | Field::Comments | Field::IssueType => {
                FieldKind::Text
            }
            Field::Status | Field::Priority => FieldKind::Enum,
            Field::Labels | Field::Components => FieldKind::Multi,
            Field::Created | Field::Updated => FieldKind::Date,
            Field::Custom { field_type, .. } => match field_type {
                FieldType::Text => FieldKind::Text,
                FieldType::Number => FieldKind::Number,
                FieldType::Date => FieldKind::Date,
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Field::Key => "key",
            Field::Project => "project",
            Field::Summary => "summary",
            Field::Description => "description",
            Field::Comments => "comment",
            Field::Status => "status",
            Field::Priority => "priority",
            Field::Assignee => "assignee",
            Field::Reporter => "reporter",
            Field::IssueType => "issuetype",
            Field::Labels => "labels",
            Field::Components => "components",
            Field::Created => "created",
            Field::Updated => "updated",
            Field::Custom { id, .. } => id,
        }
    }

    /// Whether `<`, `<=`, `>`, `>=` make sense for this field.
    pub fn is_ordered(&self) -> bool {
        matches!(self.kind(), FieldKind::Date | FieldKind::Number)
    }

    /// Whether `~` / `!~` (contains) make sense for this field.
    pub fn is_textual(&self) -> bool {
        matches!(self.kind(), FieldKind::Text | FieldKind::Multi)
    }

    /// Whether `ORDER BY` accepts this field.
    pub fn is_sortable(&self) -> bool {
        matches!(
            self,
            Field::Key
                | Field::Summary
                | Field::Status
                | Field::Priority
                | Field::Created
                | Field::Updated
        ) || self.is_ordered()
    }

    /// Text fields a pattern query scans by default.
    pub fn pattern_defaults(catalog: &FieldCatalog) -> Vec<Field> {
        let mut fields = vec![
            Field::Key,
            Field::Summary,
            Field::Description,
            Field::Comments,
            Field::Assignee,
            Field::Reporter,
            Field::Labels,
            Field::Components,
        ];
        fields.extend(
            catalog
                .custom
                .iter()
                .filter(|c| c.field_type == FieldType::Text)
                .map(|c| Field::Custom {
                    id: c.id.clone(),
                    field_type: c.field_type,
                }),
        );
        fields
    }
}

/// The set of fields the structured-query front-end accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldCatalog {
    pub custom: Vec<CustomFieldDef>,
}

impl FieldCatalog {
    pub fn new(custom: Vec<CustomFieldDef>) -> Self {
        Self { custom }
    }

    /// Resolve a field name from a query. Unknown names return `None`.
    pub fn resolve(&self, name: &str) -> Option<Field> {
        let lower = name.to_ascii_lowercase();
        let builtin = match lower.as_str() {
            "key" | "issuekey" | "id" => Some(Field::Key),
            "project" => Some(Field::Project),
            "summary" => Some(Field::Summary),
            "description" => Some(Field::Description),
            "comment" | "comments" => Some(Field::Comments),
            "status" => Some(Field::Status),
            "priority" => Some(Field::Priority),
            "assignee" => Some(Field::Assignee),
            "reporter" => Some(Field::Reporter),
            "type" | "issuetype" => Some(Field::IssueType),
            "labels" | "label" => Some(Field::Labels),
            "component" | "components" => Some(Field::Components),
            "created" | "createddate" => Some(Field::Created),
            "updated" | "updateddate" => Some(Field::Updated),
            _ => None,
        };
        if builtin.is_some() {
            return builtin;
        }

        let wanted_id = match lower
            .strip_prefix("cf[")
            .and_then(|rest| rest.strip_suffix(']'))
        {
            Some(num) => format!("customfield_{}", num),
            None => lower.clone(),
        };
        self.custom
            .iter()
            .find(|c| {
                c.id.to_ascii_lowercase() == wanted_id
                    || c.name.to_ascii_lowercase().replace(' ', "_") == lower
            })
            .map(|c| Field::Custom {
                id: c.id.clone(),
                field_type: c.field_type,
            })
    }
}

/// Custom field ids end up inside SQL JSON paths, so they are restricted.
pub fn is_valid_field_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> FieldCatalog {
        FieldCatalog::new(vec![
            CustomFieldDef {
                id: "customfield_12313240".into(),
                name: "Team".into(),
                field_type: FieldType::Text,
            },
            CustomFieldDef {
                id: "customfield_12322244".into(),
                name: "PX Impact Score".into(),
                field_type: FieldType::Number,
            },
        ])
    }

    #[test]
    fn test_resolve_builtin_case_insensitive() {
        let c = catalog();
        assert_eq!(c.resolve("STATUS"), Some(Field::Status));
        assert_eq!(c.resolve("type"), Some(Field::IssueType));
        assert_eq!(c.resolve("comments"), Some(Field::Comments));
    }

    #[test]
    fn test_resolve_custom_by_id_name_and_cf() {
        let c = catalog();
        let team = Field::Custom {
            id: "customfield_12313240".into(),
            field_type: FieldType::Text,
        };
        assert_eq!(c.resolve("customfield_12313240"), Some(team.clone()));
        assert_eq!(c.resolve("cf[12313240]"), Some(team.clone()));
        assert_eq!(c.resolve("team"), Some(team));
        assert_eq!(
            c.resolve("px_impact_score").map(|f| f.kind()),
            Some(FieldKind::Number)
        );
    }

    #[test]
    fn test_resolve_unknown() {
        assert_eq!(catalog().resolve("foo"), None);
    }

    #[test]
    fn test_field_id_validation() {
        assert!(is_valid_field_id("customfield_10010"));
        assert!(!is_valid_field_id("x\"); DROP"));
        assert!(!is_valid_field_id(""));
    }
}
