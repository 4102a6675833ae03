//! Template variables
//!
//! Variable values come resolved from the host. This module decides how they
//! are escaped into SQL, interpolates `$name`, `${name}` and `[[name]]`
//! references, and resolves `$conditionalTest` and `$unescape` calls.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Deserialize;
use tracing::debug;

use crate::error::{CompileError, Result};
use crate::fragment::{find_call, split_arguments};

/// Value of a variable with the "All" option selected
pub const ALL_VALUE: &str = "$__all";

const CONDITIONAL_TEST: &str = "$conditionalTest";
const UNESCAPE: &str = "$unescape";

static VARIABLE_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{(\w+)(?::(\w+))?\}|\[\[(\w+)(?::(\w+))?\]\]|\$(\w+)").expect("valid regex")
});

static NUMERIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*-?\d+(\.\d+)?([eE][-+]?\d+)?\s*$").expect("valid regex")
});

/// Kind of a dashboard variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    #[default]
    Query,
    Custom,
    Textbox,
    Constant,
    Interval,
    Datasource,
    Adhoc,
}

/// A variable's current value or one of its options
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum VariableValue {
    Number(f64),
    Text(String),
    List(Vec<VariableValue>),
}

impl Default for VariableValue {
    fn default() -> Self {
        VariableValue::Text(String::new())
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        VariableValue::Text(value.to_string())
    }
}

impl From<f64> for VariableValue {
    fn from(value: f64) -> Self {
        VariableValue::Number(value)
    }
}

impl<T: Into<VariableValue>> From<Vec<T>> for VariableValue {
    fn from(values: Vec<T>) -> Self {
        VariableValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl VariableValue {
    fn is_empty(&self) -> bool {
        match self {
            VariableValue::Number(_) => false,
            VariableValue::Text(text) => text.is_empty(),
            VariableValue::List(items) => items.iter().all(VariableValue::is_empty),
        }
    }

    fn is_all(&self) -> bool {
        match self {
            VariableValue::Text(text) => text == ALL_VALUE,
            VariableValue::List(items) => items.iter().any(VariableValue::is_all),
            VariableValue::Number(_) => false,
        }
    }

    fn is_numeric(&self) -> bool {
        match self {
            VariableValue::Number(_) => true,
            VariableValue::Text(text) => NUMERIC.is_match(text),
            VariableValue::List(_) => false,
        }
    }

    /// Text as typed, lists joined with commas
    fn raw(&self) -> String {
        match self {
            VariableValue::Number(n) => format_number(*n),
            VariableValue::Text(text) => text.clone(),
            VariableValue::List(items) => items
                .iter()
                .map(VariableValue::raw)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// A host-resolved dashboard variable
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: VariableKind,
    #[serde(default)]
    pub current: VariableValue,
    #[serde(default)]
    pub multi: bool,
    #[serde(default)]
    pub include_all: bool,
    #[serde(default)]
    pub options: Vec<VariableValue>,
    /// Custom text substituted when "All" is selected
    #[serde(default)]
    pub all_value: Option<String>,
}

impl Variable {
    pub fn new(name: &str, kind: VariableKind, current: impl Into<VariableValue>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            current: current.into(),
            multi: false,
            include_all: false,
            options: Vec::new(),
            all_value: None,
        }
    }

    pub fn multi(mut self) -> Self {
        self.multi = true;
        self
    }

    pub fn include_all(mut self) -> Self {
        self.include_all = true;
        self
    }

    pub fn with_options<T: Into<VariableValue>>(mut self, options: Vec<T>) -> Self {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the current value selects something.
    ///
    /// Empty values are unset. "All" is unset for variables built from a
    /// list of options, since selecting everything filters nothing, but is a
    /// literal value for free-text variables.
    pub fn is_set(&self) -> bool {
        if self.current.is_empty() {
            return false;
        }
        if self.current.is_all() {
            return matches!(self.kind, VariableKind::Textbox | VariableKind::Constant);
        }
        true
    }

    /// Options other than "All" all look like numbers
    fn numeric_options(&self) -> bool {
        self.options
            .iter()
            .filter(|option| !option.is_all())
            .all(VariableValue::is_numeric)
    }

    /// One value escaped as a SQL literal
    pub fn escape(&self, value: &VariableValue) -> String {
        match value {
            VariableValue::Number(n) => format_number(*n),
            VariableValue::Text(text) if self.numeric_options() && NUMERIC.is_match(text) => {
                text.trim().to_string()
            }
            VariableValue::Text(text) => quote(text),
            VariableValue::List(items) => format!(
                "[{}]",
                items
                    .iter()
                    .map(|item| self.escape(item))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }

    /// Text substituted for a reference to this variable
    pub fn render(&self) -> String {
        if !self.multi && !self.include_all {
            return self.current.raw();
        }

        if self.include_all && self.current.is_all() {
            if let Some(all) = &self.all_value {
                return all.clone();
            }
            return self.escape_list(self.options.iter().filter(|option| !option.is_all()));
        }

        match &self.current {
            VariableValue::List(items) => self.escape_list(items.iter()),
            value => self.escape(value),
        }
    }

    fn escape_list<'a>(&self, values: impl Iterator<Item = &'a VariableValue>) -> String {
        values
            .map(|value| self.escape(value))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Replace variable references with their rendered values; unknown names stay
pub fn interpolate(query: &str, variables: &[Variable]) -> String {
    VARIABLE_REFERENCE
        .replace_all(query, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(5))
                .map_or("", |m| m.as_str());
            let format = caps.get(2).or_else(|| caps.get(4)).map(|m| m.as_str());

            match variables.iter().find(|variable| variable.name == name) {
                Some(variable) => match format {
                    Some("raw") | Some("csv") => variable.current.raw(),
                    _ => variable.render(),
                },
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Replace each `$conditionalTest(sql, $var)` or
/// `$conditionalTest(sqlIfSet, sqlIfEmpty, $var)` with the branch selected
/// by the variable
pub fn resolve_conditionals(query: &str, variables: &[Variable]) -> Result<String> {
    let mut query = query.to_string();
    loop {
        let Some((start, end, args)) = find_call(&query, CONDITIONAL_TEST)? else {
            break;
        };
        let args = split_arguments(args)?;

        let (if_set, if_empty, reference) = match args.as_slice() {
            [if_set, reference] => (if_set.clone(), String::new(), reference),
            [if_set, if_empty, reference] => (if_set.clone(), if_empty.clone(), reference),
            _ => {
                return Err(CompileError::MacroArity {
                    macro_name: CONDITIONAL_TEST.to_string(),
                    expected: "2 or 3",
                    args,
                });
            }
        };

        let name = variable_name(reference);
        let variable = variables
            .iter()
            .find(|variable| variable.name == name)
            .ok_or_else(|| CompileError::UnresolvedVariable {
                name: name.to_string(),
            })?;

        let set = variable.is_set();
        debug!(variable = %name, set, "conditional test resolved");
        let replacement = if set { if_set } else { if_empty };
        query.replace_range(start..end, &replacement);
    }
    Ok(query)
}

/// Replace each `$unescape(...)` with its argument, single quotes removed
pub fn unescape(query: &str) -> Result<String> {
    let mut query = query.to_string();
    loop {
        let Some((start, end, args)) = find_call(&query, UNESCAPE)? else {
            break;
        };
        let replacement = args.replace('\'', "");
        query.replace_range(start..end, &replacement);
    }
    Ok(query)
}

/// `$v`, `${v}`, `${v:format}` or `[[v]]` to `v`
fn variable_name(reference: &str) -> &str {
    let reference = reference.trim();
    let name = if let Some(inner) = reference
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        inner
    } else if let Some(inner) = reference
        .strip_prefix("[[")
        .and_then(|rest| rest.strip_suffix("]]"))
    {
        inner
    } else {
        reference.strip_prefix('$').unwrap_or(reference)
    };
    name.split(':').next().unwrap_or(name)
}

pub(crate) fn is_numeric(text: &str) -> bool {
    NUMERIC.is_match(text)
}

pub(crate) fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'"))
}

pub(crate) fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Read back a literal produced by `quote`
    fn unquote(literal: &str) -> Option<String> {
        let inner = literal.strip_prefix('\'')?.strip_suffix('\'')?;
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                out.push(chars.next()?);
            } else {
                out.push(c);
            }
        }
        Some(out)
    }

    #[test]
    fn test_single_value_is_raw() {
        let vars = vec![Variable::new("host", VariableKind::Custom, "web-1")];
        assert_eq!(interpolate("WHERE host = '$host'", &vars), "WHERE host = 'web-1'");
    }

    #[test]
    fn test_multi_value_is_quoted_and_joined() {
        let vars = vec![
            Variable::new("host", VariableKind::Query, vec!["a", "b'c"])
                .multi()
                .with_options(vec!["a", "b'c", "d"]),
        ];
        assert_eq!(
            interpolate("host IN ($host)", &vars),
            r"host IN ('a','b\'c')"
        );
    }

    #[test]
    fn test_numeric_options_stay_bare() {
        let vars = vec![
            Variable::new("code", VariableKind::Custom, vec!["200", "404"])
                .multi()
                .with_options(vec!["200", "404", "500"]),
        ];
        assert_eq!(interpolate("code IN (${code})", &vars), "code IN (200,404)");
    }

    #[test]
    fn test_numeric_looking_value_among_text_options_is_quoted() {
        let vars = vec![
            Variable::new("v", VariableKind::Custom, vec!["1"])
                .multi()
                .with_options(vec!["1", "x"]),
        ];
        assert_eq!(interpolate("[[v]]", &vars), "'1'");
    }

    #[test]
    fn test_all_value() {
        let base = Variable::new("dc", VariableKind::Query, vec![ALL_VALUE])
            .multi()
            .include_all()
            .with_options(vec![ALL_VALUE, "eu", "us"]);
        assert_eq!(interpolate("$dc", &[base.clone()]), "'eu','us'");

        let custom = Variable {
            all_value: Some(".*".to_string()),
            ..base
        };
        assert_eq!(interpolate("$dc", &[custom]), ".*");
    }

    #[test]
    fn test_nested_lists_render_as_arrays() {
        let var = Variable::new(
            "pairs",
            VariableKind::Custom,
            VariableValue::List(vec![
                VariableValue::from(vec!["a", "b"]),
                VariableValue::from(vec![1.0, 2.5]),
            ]),
        )
        .multi();
        assert_eq!(var.render(), "['a', 'b'],[1, 2.5]");
    }

    #[test]
    fn test_unknown_and_raw_references() {
        let vars = vec![
            Variable::new("v", VariableKind::Custom, vec!["a", "b"]).multi(),
        ];
        assert_eq!(interpolate("$timeFilter $v2 ${v:raw}", &vars), "$timeFilter $v2 a,b");
    }

    #[test]
    fn test_conditional_test_two_arguments() {
        let empty = vec![Variable::new("v", VariableKind::Custom, Vec::<&str>::new())];
        let query = "SELECT 1 FROM t WHERE x = 1 $conditionalTest(AND col=10, $v)";
        assert_eq!(
            resolve_conditionals(query, &empty).unwrap(),
            "SELECT 1 FROM t WHERE x = 1 "
        );

        let set = vec![Variable::new("v", VariableKind::Custom, vec!["a", "b"])];
        assert_eq!(
            resolve_conditionals(query, &set).unwrap(),
            "SELECT 1 FROM t WHERE x = 1 AND col=10"
        );
    }

    #[test]
    fn test_conditional_test_else_branch() {
        let vars = vec![Variable::new("host", VariableKind::Query, ALL_VALUE)];
        let query = "WHERE $conditionalTest(host IN ($host), 1, ${host})";
        assert_eq!(resolve_conditionals(query, &vars).unwrap(), "WHERE 1");
    }

    #[test]
    fn test_conditional_test_unknown_variable() {
        let err = resolve_conditionals("$conditionalTest(AND a, $missing)", &[]).unwrap_err();
        assert_eq!(
            err,
            CompileError::UnresolvedVariable {
                name: "missing".to_string()
            }
        );
    }

    #[test]
    fn test_conditional_test_arity() {
        let err = resolve_conditionals("$conditionalTest($v)", &[]).unwrap_err();
        assert!(matches!(err, CompileError::MacroArity { .. }));
    }

    #[test]
    fn test_is_set_truth_table() {
        use VariableKind::*;

        let cases: Vec<(VariableKind, VariableValue, bool)> = vec![
            (Query, "".into(), false),
            (Query, Vec::<&str>::new().into(), false),
            (Query, ALL_VALUE.into(), false),
            (Query, vec![ALL_VALUE].into(), false),
            (Query, "a".into(), true),
            (Custom, ALL_VALUE.into(), false),
            (Custom, vec!["a", "b"].into(), true),
            (Textbox, "".into(), false),
            (Textbox, ALL_VALUE.into(), true),
            (Textbox, "x".into(), true),
            (Constant, ALL_VALUE.into(), true),
            (Interval, "1m".into(), true),
            (Datasource, ALL_VALUE.into(), false),
            (Query, 0.0.into(), true),
        ];
        for (kind, value, expected) in cases {
            let variable = Variable::new("v", kind, value.clone());
            assert_eq!(variable.is_set(), expected, "{kind:?} {value:?}");
        }
    }

    #[test]
    fn test_unescape() {
        assert_eq!(
            unescape("SELECT $unescape('col_a'), $unescape('b') FROM t").unwrap(),
            "SELECT col_a, b FROM t"
        );
    }

    #[test]
    fn test_variable_name_forms() {
        assert_eq!(variable_name("$v"), "v");
        assert_eq!(variable_name(" ${v:csv} "), "v");
        assert_eq!(variable_name("[[v]]"), "v");
        assert_eq!(variable_name("v"), "v");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn variable_kind() -> impl Strategy<Value = VariableKind> {
            prop::sample::select(vec![
                VariableKind::Query,
                VariableKind::Custom,
                VariableKind::Textbox,
                VariableKind::Constant,
                VariableKind::Interval,
                VariableKind::Datasource,
                VariableKind::Adhoc,
            ])
        }

        proptest! {
            #[test]
            fn test_empty_values_are_never_set(kind in variable_kind(), len in 0usize..3) {
                let value = VariableValue::List(vec![VariableValue::from(""); len]);
                prop_assert!(!Variable::new("v", kind, value).is_set());
            }

            #[test]
            fn test_all_is_set_only_for_free_text(kind in variable_kind(), multi in any::<bool>()) {
                let value: VariableValue = if multi { vec![ALL_VALUE].into() } else { ALL_VALUE.into() };
                let expected = matches!(kind, VariableKind::Textbox | VariableKind::Constant);
                prop_assert_eq!(Variable::new("v", kind, value).is_set(), expected);
            }

            #[test]
            fn test_numeric_options_interpolate_bare(values in prop::collection::vec(0u32..100_000, 1..5)) {
                let options: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                let variable = Variable::new("v", VariableKind::Custom, options.iter().map(String::as_str).collect::<Vec<_>>())
                    .multi()
                    .with_options(options.iter().map(String::as_str).collect::<Vec<_>>());
                prop_assert_eq!(interpolate("$v", &[variable]), options.join(","));
            }

            #[test]
            fn test_escaped_text_round_trips(text in "[a-z'\\\\ ]{0,12}x") {
                let variable = Variable::new("v", VariableKind::Custom, vec![text.as_str()])
                    .multi()
                    .with_options(vec![text.as_str(), "other"]);
                let rendered = interpolate("$v", &[variable]);
                prop_assert_eq!(unquote(&rendered), Some(text));
            }
        }
    }
}
