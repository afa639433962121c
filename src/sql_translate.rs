//! Predicate → SQL translation for the SQLite store.
//!
//! Produces a `WHERE` fragment over `issues i` that agrees with
//! [`Predicate::matches`]: every leaf is wrapped so a missing value yields
//! `0` rather than `NULL`, which keeps `NOT` two-valued. Regular expressions
//! have no SQL form; predicates containing one return `None` and are
//! evaluated in process instead.

use jira_mirror_core::fields::{Field, FieldKind, FieldType};
use jira_mirror_core::query::{CompareOp, Operand, Predicate, SortSpec};

/// A positional bind value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
    Real(f64),
}

/// A `WHERE` fragment and its parameters, in placeholder order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFilter {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

/// Where a text-like field's values live.
enum TextSource {
    Columns(&'static [&'static str]),
    JsonArray(&'static str),
    Custom(String),
}

fn text_source(field: &Field) -> TextSource {
    match field {
        Field::Key => TextSource::Columns(&["i.key"]),
        Field::Project => TextSource::Columns(&["i.project_key", "i.project_name"]),
        Field::Summary => TextSource::Columns(&["i.summary"]),
        Field::Description => TextSource::Columns(&["i.description"]),
        Field::Comments => TextSource::Columns(&["i.comments_text"]),
        Field::Status => TextSource::Columns(&["i.status_name"]),
        Field::Priority => TextSource::Columns(&["i.priority_name"]),
        Field::Assignee => TextSource::Columns(&["i.assignee_id", "i.assignee_name"]),
        Field::Reporter => TextSource::Columns(&["i.reporter_id", "i.reporter_name"]),
        Field::IssueType => TextSource::Columns(&["i.issue_type"]),
        Field::Labels => TextSource::JsonArray("i.labels_json"),
        Field::Components => TextSource::JsonArray("i.components_json"),
        Field::Created => TextSource::Columns(&["i.created_at"]),
        Field::Updated => TextSource::Columns(&["i.updated_at"]),
        Field::Custom { id, .. } => TextSource::Custom(id.clone()),
    }
}

/// `json_extract` path for a custom field. Ids are validated at config load
/// to `[A-Za-z0-9_]`, so they are safe inside the literal.
fn custom_path(id: &str) -> String {
    format!("'$.{}'", id)
}

fn custom_text_expr(id: &str) -> String {
    let path = custom_path(id);
    format!(
        "CASE WHEN json_type(i.custom_json, {p}) IN ('text', 'integer', 'real') \
         THEN CAST(json_extract(i.custom_json, {p}) AS TEXT) END",
        p = path
    )
}

fn date_expr(field: &Field) -> Option<String> {
    match field {
        Field::Created => Some("i.created_at".to_string()),
        Field::Updated => Some("i.updated_at".to_string()),
        Field::Custom {
            id,
            field_type: FieldType::Date,
        } => Some(format!(
            "CASE WHEN json_type(i.custom_json, {p}) = 'integer' THEN json_extract(i.custom_json, {p}) END",
            p = custom_path(id)
        )),
        _ => None,
    }
}

fn number_expr(field: &Field) -> Option<String> {
    match field {
        Field::Custom { id, .. } => Some(format!(
            "CASE WHEN json_type(i.custom_json, {p}) IN ('integer', 'real') THEN json_extract(i.custom_json, {p}) END",
            p = custom_path(id)
        )),
        _ => None,
    }
}

fn enum_columns(field: &Field) -> (&'static str, &'static str) {
    if *field == Field::Priority {
        ("i.priority_code", "i.priority_name")
    } else {
        ("i.status_code", "i.status_name")
    }
}

struct Builder {
    params: Vec<SqlParam>,
}

impl Builder {
    fn text(&mut self, s: &str) -> &'static str {
        self.params.push(SqlParam::Text(s.to_string()));
        "?"
    }

    /// SQL that is true when the field has at least one non-empty value.
    fn present(&mut self, field: &Field) -> String {
        match field.kind() {
            FieldKind::Enum => {
                let (code, name) = enum_columns(field);
                format!("({} <> 0 OR {} IS NOT NULL)", code, name)
            }
            FieldKind::Date => match date_expr(field) {
                Some(e) => format!("({}) IS NOT NULL", e),
                None => "0".to_string(),
            },
            FieldKind::Number => match number_expr(field) {
                Some(e) => format!("({}) IS NOT NULL", e),
                None => "0".to_string(),
            },
            _ => match text_source(field) {
                TextSource::Columns(cols) => {
                    let parts: Vec<String> = cols
                        .iter()
                        .map(|c| format!("COALESCE({}, '') <> ''", c))
                        .collect();
                    format!("({})", parts.join(" OR "))
                }
                TextSource::JsonArray(col) => format!(
                    "EXISTS (SELECT 1 FROM json_each({}) WHERE value <> '')",
                    col
                ),
                TextSource::Custom(id) => {
                    format!("COALESCE({}, '') <> ''", custom_text_expr(&id))
                }
            },
        }
    }

    /// True when any value of the field satisfies `cmp(value_expr, ?)`.
    fn any_text(&mut self, field: &Field, want: &str, contains: bool) -> String {
        let test = |expr: &str, b: &mut Builder| {
            let p = b.text(want);
            if contains {
                format!("instr(lower({}), lower({})) > 0", expr, p)
            } else {
                format!("lower({}) = lower({})", expr, p)
            }
        };
        match text_source(field) {
            TextSource::Columns(cols) => {
                let parts: Vec<String> = cols
                    .iter()
                    .map(|c| format!("COALESCE({}, 0)", test(c, self)))
                    .collect();
                format!("({})", parts.join(" OR "))
            }
            TextSource::JsonArray(col) => format!(
                "EXISTS (SELECT 1 FROM json_each({}) WHERE value <> '' AND {})",
                col,
                test("value", self)
            ),
            TextSource::Custom(id) => {
                format!("COALESCE({}, 0)", test(&custom_text_expr(&id), self))
            }
        }
    }

    fn enum_eq(&mut self, field: &Field, code: i64, label: &str) -> String {
        let (code_col, name_col) = enum_columns(field);
        if code != 0 {
            self.params.push(SqlParam::Int(code));
            format!("{} = ?", code_col)
        } else {
            let p = self.text(label.trim());
            format!("COALESCE(lower(trim({})) = lower({}), 0)", name_col, p)
        }
    }

    fn ordered(&mut self, expr: &str, op: CompareOp, param: SqlParam) -> String {
        let sym = match op {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Contains | CompareOp::NotContains => return "0".to_string(),
        };
        self.params.push(param);
        format!("COALESCE(({}) {} ?, 0)", expr, sym)
    }

    fn compare(&mut self, field: &Field, op: CompareOp, value: &Operand) -> String {
        match (field.kind(), value) {
            (FieldKind::Enum, Operand::Enum { code, label }) => {
                let present = self.present(field);
                match op {
                    CompareOp::Eq => {
                        let eq = self.enum_eq(field, *code, label);
                        format!("({} AND {})", present, eq)
                    }
                    CompareOp::Ne => {
                        let eq = self.enum_eq(field, *code, label);
                        format!("({} AND NOT {})", present, eq)
                    }
                    _ => "0".to_string(),
                }
            }
            (FieldKind::Date, Operand::Date(d)) => match date_expr(field) {
                Some(e) => self.ordered(&e, op, SqlParam::Int(d.timestamp_millis())),
                None => "0".to_string(),
            },
            (FieldKind::Number, Operand::Number(n)) => match number_expr(field) {
                Some(e) => self.ordered(&e, op, SqlParam::Real(*n)),
                None => "0".to_string(),
            },
            (_, Operand::Text(want)) => match op {
                CompareOp::Eq => self.any_text(field, want, false),
                CompareOp::Contains => self.any_text(field, want, true),
                CompareOp::Ne | CompareOp::NotContains => {
                    let present = self.present(field);
                    let any = self.any_text(field, want, op == CompareOp::NotContains);
                    format!("({} AND NOT {})", present, any)
                }
                _ => "0".to_string(),
            },
            _ => "0".to_string(),
        }
    }

    fn predicate(&mut self, p: &Predicate) -> Option<String> {
        Some(match p {
            Predicate::All => "1".to_string(),
            Predicate::Nothing => "0".to_string(),
            Predicate::Compare { field, op, value } => self.compare(field, *op, value),
            Predicate::In {
                field,
                values,
                negated,
            } => {
                let present = self.present(field);
                let alts: Vec<String> = values
                    .iter()
                    .map(|v| self.compare(field, CompareOp::Eq, v))
                    .collect();
                let any = if alts.is_empty() {
                    "0".to_string()
                } else {
                    format!("({})", alts.join(" OR "))
                };
                if *negated {
                    format!("({} AND NOT {})", present, any)
                } else {
                    format!("({} AND {})", present, any)
                }
            }
            Predicate::Empty { field, negated } => {
                let present = self.present(field);
                if *negated {
                    present
                } else {
                    format!("NOT {}", present)
                }
            }
            Predicate::Text(query) => {
                let mut alts = Vec::new();
                if let Some(hint) = &query.key_hint {
                    alts.push(format!("i.key = {}", self.text(hint)));
                }
                if !query.is_empty() {
                    let p = self.text(&query.fts_expression());
                    alts.push(format!(
                        "i.id IN (SELECT rowid FROM issues_fts WHERE issues_fts MATCH {})",
                        p
                    ));
                }
                if alts.is_empty() {
                    "0".to_string()
                } else {
                    format!("({})", alts.join(" OR "))
                }
            }
            Predicate::Pattern(_) => return None,
            Predicate::And(parts) | Predicate::Or(parts) => {
                let joiner = if matches!(p, Predicate::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                if parts.is_empty() {
                    return Some(if joiner == " AND " { "1" } else { "0" }.to_string());
                }
                let mut sqls = Vec::with_capacity(parts.len());
                for part in parts {
                    sqls.push(self.predicate(part)?);
                }
                format!("({})", sqls.join(joiner))
            }
            Predicate::Not(inner) => format!("NOT ({})", self.predicate(inner)?),
        })
    }
}

/// Translate a predicate, or `None` when it needs in-process evaluation.
pub fn translate(predicate: &Predicate) -> Option<SqlFilter> {
    let mut b = Builder { params: Vec::new() };
    let sql = b.predicate(predicate)?;
    Some(SqlFilter {
        sql,
        params: b.params,
    })
}

/// `ORDER BY` terms for a sort spec, ending with the standard tie-breaker.
pub fn order_by(spec: &SortSpec) -> String {
    let dir = if spec.descending { "DESC" } else { "ASC" };
    let primary = match spec.field.kind() {
        FieldKind::Key => format!("i.project_key {d}, i.key_num {d}", d = dir),
        FieldKind::Enum => format!("{} {}", enum_columns(&spec.field).0, dir),
        FieldKind::Date => format!(
            "{} {}",
            date_expr(&spec.field).unwrap_or_else(|| "NULL".into()),
            dir
        ),
        FieldKind::Number => format!(
            "{} {}",
            number_expr(&spec.field).unwrap_or_else(|| "NULL".into()),
            dir
        ),
        _ => {
            let expr = match text_source(&spec.field) {
                TextSource::Columns(cols) => cols[0].to_string(),
                TextSource::JsonArray(col) => format!("json_extract({}, '$[0]')", col),
                TextSource::Custom(id) => custom_text_expr(&id),
            };
            format!("NULLIF(lower({}), '') {}", expr, dir)
        }
    };
    format!("{}, i.updated_at DESC, i.key ASC", primary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jira_mirror_core::fields::FieldCatalog;
    use jira_mirror_core::query::structured::parse;

    fn filter(q: &str) -> SqlFilter {
        let (pred, _) = parse(q, &FieldCatalog::default()).unwrap();
        translate(&pred).unwrap()
    }

    #[test]
    fn test_known_enum_binds_code() {
        let f = filter("status = Open");
        assert!(f.sql.contains("i.status_code = ?"));
        assert_eq!(f.params, vec![SqlParam::Int(1)]);
    }

    #[test]
    fn test_unknown_enum_binds_label() {
        let f = filter("status = \"Waiting for QA\"");
        assert!(f.sql.contains("lower(trim(i.status_name))"));
        assert_eq!(f.params, vec![SqlParam::Text("Waiting for QA".into())]);
    }

    #[test]
    fn test_params_follow_placeholder_order() {
        let f = filter("assignee = alice AND labels IN (ui, backend)");
        let placeholders = f.sql.matches('?').count();
        assert_eq!(placeholders, f.params.len());
        assert_eq!(f.params[0], SqlParam::Text("alice".into()));
        assert_eq!(f.params.last(), Some(&SqlParam::Text("backend".into())));
    }

    #[test]
    fn test_not_stays_two_valued() {
        let f = filter("NOT description ~ crash");
        assert!(f.sql.starts_with("NOT ("));
        assert!(f.sql.contains("COALESCE(instr("));
    }

    #[test]
    fn test_order_by() {
        let (_, ranking) = parse("project = A ORDER BY key ASC", &FieldCatalog::default()).unwrap();
        match ranking {
            jira_mirror_core::query::Ranking::Sort(spec) => assert_eq!(
                order_by(&spec),
                "i.project_key ASC, i.key_num ASC, i.updated_at DESC, i.key ASC"
            ),
            other => panic!("unexpected ranking {:?}", other),
        }
    }
}
