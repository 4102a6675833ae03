//! Ad-hoc filters
//!
//! Host-supplied `key operator value` predicates. A filter only applies when
//! its `database.table` qualifier matches the table the query reads from.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::ast::{Ast, Source};
use crate::error::{CompileError, Result};
use crate::template::{format_number, is_numeric, quote};

/// Placeholder the host can use to position filters itself
pub const ADHOC: &str = "$adhoc";

/// Qualifier matching any database or table
const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AdHocValue {
    Number(f64),
    Text(String),
}

impl AdHocValue {
    fn to_sql(&self) -> String {
        match self {
            AdHocValue::Number(n) => format_number(*n),
            AdHocValue::Text(text) if is_numeric(text) => text.trim().to_string(),
            AdHocValue::Text(text) => quote(text),
        }
    }
}

impl From<&str> for AdHocValue {
    fn from(value: &str) -> Self {
        AdHocValue::Text(value.to_string())
    }
}

impl From<f64> for AdHocValue {
    fn from(value: f64) -> Self {
        AdHocValue::Number(value)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AdHocFilter {
    /// `column`, `table.column` or `database.table.column`
    pub key: String,
    pub operator: String,
    pub value: AdHocValue,
}

impl AdHocFilter {
    pub fn new(key: &str, operator: &str, value: impl Into<AdHocValue>) -> Self {
        Self {
            key: key.to_string(),
            operator: operator.to_string(),
            value: value.into(),
        }
    }

    /// The predicate for `target`, or `None` when the filter is meant for
    /// another table
    pub fn condition(&self, target: Option<&Target>) -> Result<Option<String>> {
        let format_error = |reason: &str| CompileError::AdHocFilterFormat {
            key: self.key.clone(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = self.key.split('.').map(str::trim).collect();
        if parts.iter().any(|part| part.is_empty()) {
            return Err(format_error("empty key part"));
        }
        let (database, table, column) = match (parts.as_slice(), target) {
            ([db, table, column], _) => (*db, *table, *column),
            ([table, column], Some(target)) => (target.database.as_str(), *table, *column),
            ([column], Some(target)) => (target.database.as_str(), target.table.as_str(), *column),
            ([_] | [_, _], None) => return Err(format_error("no target table to qualify it with")),
            _ => return Err(format_error("expected database.table.column")),
        };
        let operator = map_operator(&self.operator).ok_or_else(|| format_error("unknown operator"))?;

        let Some(target) = target else {
            return Ok(None);
        };
        if !target.matches(database, table) {
            return Ok(None);
        }
        Ok(Some(format!("{column} {operator} {}", self.value.to_sql())))
    }
}

fn map_operator(operator: &str) -> Option<&'static str> {
    let mapped = match operator.trim() {
        "=" => "=",
        "!=" => "!=",
        "<>" => "<>",
        ">" => ">",
        "<" => "<",
        ">=" => ">=",
        "<=" => "<=",
        "=~" => "LIKE",
        "!~" => "NOT LIKE",
        _ => return None,
    };
    Some(mapped)
}

/// Table a query reads from at its innermost level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub database: String,
    pub table: String,
}

impl Target {
    /// Resolve the first FROM item of the innermost query. `$table` stands
    /// for the configured table; an unqualified name takes the configured
    /// database.
    pub fn resolve(ast: &Ast, database: &str, table: &str) -> Option<Self> {
        let Some(Source::Table(items)) = &innermost(ast).from else {
            return None;
        };
        let reference = items.first()?.split_whitespace().next()?;
        if reference == "$table" {
            return Some(Target {
                database: database.to_string(),
                table: table.to_string(),
            });
        }
        let names: Vec<String> = reference.split('.').map(unquote_identifier).collect();
        match names.as_slice() {
            [db, table] => Some(Target {
                database: db.clone(),
                table: table.clone(),
            }),
            [table] => Some(Target {
                database: database.to_string(),
                table: table.clone(),
            }),
            _ => None,
        }
    }

    fn matches(&self, database: &str, table: &str) -> bool {
        (database == WILDCARD || database == self.database) && (table == WILDCARD || table == self.table)
    }
}

fn innermost(ast: &Ast) -> &Ast {
    match &ast.from {
        Some(Source::Subquery(sub)) => innermost(sub),
        _ => ast,
    }
}

fn unquote_identifier(name: &str) -> String {
    name.trim_matches(|c| c == '`' || c == '"').to_string()
}

/// Predicates of every filter that applies to `target`. Malformed filters are
/// logged and skipped.
pub fn conditions(filters: &[AdHocFilter], target: Option<&Target>) -> Vec<String> {
    let mut conditions = Vec::new();
    for filter in filters {
        match filter.condition(target) {
            Ok(Some(condition)) => conditions.push(condition),
            Ok(None) => debug!(filter = %filter.key, "ad-hoc filter targets another table"),
            Err(err) => warn!(filter = %filter.key, error = %err, "skipping ad-hoc filter"),
        }
    }
    conditions
}

/// Append `conditions` to the WHERE clause of the innermost query
pub fn inject(ast: &mut Ast, conditions: &[String]) {
    if conditions.is_empty() {
        return;
    }
    let where_clause = ast.innermost_mut().where_clause.get_or_insert_with(Vec::new);
    for condition in conditions {
        if where_clause.is_empty() {
            where_clause.push(condition.clone());
        } else {
            where_clause.push(format!("AND {condition}"));
        }
    }
}

/// Value substituted for `$adhoc`
pub fn render(conditions: &[String]) -> String {
    if conditions.is_empty() {
        "1".to_string()
    } else {
        format!("({})", conditions.join(" AND "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_query;
    use crate::printer::print_ast;

    fn target(database: &str, table: &str) -> Target {
        Target {
            database: database.to_string(),
            table: table.to_string(),
        }
    }

    #[test]
    fn test_like_operator_on_qualified_key() {
        let filter = AdHocFilter::new("db.tbl.col", "=~", "%x%");
        let condition = filter.condition(Some(&target("db", "tbl"))).unwrap();
        assert_eq!(condition.as_deref(), Some("col LIKE '%x%'"));
    }

    #[test]
    fn test_partial_keys_take_target_qualifiers() {
        let t = target("db", "tbl");
        let by_table = AdHocFilter::new("tbl.col", "!~", "a%");
        assert_eq!(
            by_table.condition(Some(&t)).unwrap().as_deref(),
            Some("col NOT LIKE 'a%'")
        );
        let by_column = AdHocFilter::new("col", ">", 10.0);
        assert_eq!(by_column.condition(Some(&t)).unwrap().as_deref(), Some("col > 10"));
    }

    #[test]
    fn test_other_table_is_ignored() {
        let filter = AdHocFilter::new("db.other.col", "=", "x");
        assert_eq!(filter.condition(Some(&target("db", "tbl"))).unwrap(), None);
    }

    #[test]
    fn test_wildcard_qualifiers() {
        let filter = AdHocFilter::new("*.*.col", "=", "x");
        assert_eq!(
            filter.condition(Some(&target("db", "tbl"))).unwrap().as_deref(),
            Some("col = 'x'")
        );
    }

    #[test]
    fn test_numeric_text_is_not_quoted() {
        let filter = AdHocFilter::new("col", "=", "42");
        assert_eq!(
            filter.condition(Some(&target("db", "t"))).unwrap().as_deref(),
            Some("col = 42")
        );
    }

    #[test]
    fn test_format_errors() {
        let t = target("db", "t");
        for (key, operator) in [("a.b.c.d", "="), ("db..col", "="), ("col", "~~")] {
            let err = AdHocFilter::new(key, operator, "x").condition(Some(&t)).unwrap_err();
            match err {
                CompileError::AdHocFilterFormat { key: k, .. } => assert_eq!(k, key),
                other => panic!("Expected AdHocFilterFormat, got {other:?}"),
            }
        }
        let err = AdHocFilter::new("col", "=", "x").condition(None).unwrap_err();
        assert!(matches!(err, CompileError::AdHocFilterFormat { .. }));
    }

    #[test]
    fn test_malformed_filter_is_skipped() {
        let filters = [
            AdHocFilter::new("a.b.c.d", "=", "x"),
            AdHocFilter::new("col", "=", "y"),
        ];
        assert_eq!(conditions(&filters, Some(&target("db", "t"))), vec!["col = 'y'"]);
    }

    #[test]
    fn test_target_resolution() {
        let ast = parse_query("SELECT a FROM (SELECT a FROM db.tbl AS x)").unwrap();
        assert_eq!(Target::resolve(&ast, "d", "t"), Some(target("db", "tbl")));

        let ast = parse_query("SELECT a FROM $table").unwrap();
        assert_eq!(Target::resolve(&ast, "d", "t"), Some(target("d", "t")));

        let ast = parse_query("SELECT a FROM `events`").unwrap();
        assert_eq!(Target::resolve(&ast, "d", "t"), Some(target("d", "events")));

        let ast = parse_query("SELECT 1").unwrap();
        assert_eq!(Target::resolve(&ast, "d", "t"), None);
    }

    #[test]
    fn test_inject_into_innermost_where() {
        let mut ast = parse_query("SELECT a FROM (SELECT a FROM db.tbl WHERE b = 1)").unwrap();
        inject(&mut ast, &["col LIKE '%x%'".to_string()]);
        assert_eq!(
            print_ast(&ast),
            "SELECT a\nFROM (\n    SELECT a\n    FROM db.tbl\n    WHERE\n        b = 1\n        AND col LIKE '%x%'\n)"
        );
    }

    #[test]
    fn test_inject_creates_where() {
        let mut ast = parse_query("SELECT a FROM t").unwrap();
        inject(&mut ast, &["x = 1".to_string(), "y = 2".to_string()]);
        assert_eq!(
            ast.where_clause,
            Some(vec!["x = 1".to_string(), "AND y = 2".to_string()])
        );
    }

    #[test]
    fn test_render_placeholder() {
        assert_eq!(render(&[]), "1");
        assert_eq!(render(&["a = 1".to_string(), "b = 2".to_string()]), "(a = 1 AND b = 2)");
    }
}
