//! Aggregation macro expansion
//!
//! A query such as `$rate(count() AS c) FROM t` is rewritten into plain SQL:
//! an inner subquery bucketing rows by `$timeSeries`, wrapped by outer
//! selects that difference, divide or pivot the bucketed values. Text before
//! the macro and the `FROM` tail are passed through verbatim.

use tracing::debug;

use crate::ast::{Ast, MacroArgs};
use crate::error::{CompileError, Result};
use crate::fragment::{
    between_braces, ends_with_line_comment, find_keyword, split_alias, split_arguments,
    split_union_all, top_level_tokens,
};
use crate::lexer::{Lexer, Token, TokenKind, tokenize};

/// The aggregation macros, in detection priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMacro {
    Columns,
    ColumnsMs,
    RateColumns,
    RateColumnsAggregated,
    Rate,
    PerSecond,
    PerSecondColumns,
    PerSecondColumnsAggregated,
    Increase,
    IncreaseColumns,
    IncreaseColumnsAggregated,
    Delta,
    DeltaColumns,
    DeltaColumnsAggregated,
}

impl AggregationMacro {
    pub const PRIORITY: [AggregationMacro; 14] = [
        AggregationMacro::Columns,
        AggregationMacro::ColumnsMs,
        AggregationMacro::RateColumns,
        AggregationMacro::RateColumnsAggregated,
        AggregationMacro::Rate,
        AggregationMacro::PerSecond,
        AggregationMacro::PerSecondColumns,
        AggregationMacro::PerSecondColumnsAggregated,
        AggregationMacro::Increase,
        AggregationMacro::IncreaseColumns,
        AggregationMacro::IncreaseColumnsAggregated,
        AggregationMacro::Delta,
        AggregationMacro::DeltaColumns,
        AggregationMacro::DeltaColumnsAggregated,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AggregationMacro::Columns => "$columns",
            AggregationMacro::ColumnsMs => "$columnsMs",
            AggregationMacro::RateColumns => "$rateColumns",
            AggregationMacro::RateColumnsAggregated => "$rateColumnsAggregated",
            AggregationMacro::Rate => "$rate",
            AggregationMacro::PerSecond => "$perSecond",
            AggregationMacro::PerSecondColumns => "$perSecondColumns",
            AggregationMacro::PerSecondColumnsAggregated => "$perSecondColumnsAggregated",
            AggregationMacro::Increase => "$increase",
            AggregationMacro::IncreaseColumns => "$increaseColumns",
            AggregationMacro::IncreaseColumnsAggregated => "$increaseColumnsAggregated",
            AggregationMacro::Delta => "$delta",
            AggregationMacro::DeltaColumns => "$deltaColumns",
            AggregationMacro::DeltaColumnsAggregated => "$deltaColumnsAggregated",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::PRIORITY.into_iter().find(|m| m.name() == name)
    }

    fn check_arity(self, args: &[String]) -> Result<()> {
        use AggregationMacro::*;

        let (valid, expected) = match self {
            Columns | ColumnsMs | RateColumns | PerSecondColumns | IncreaseColumns
            | DeltaColumns => (args.len() == 2, "exactly 2"),
            RateColumnsAggregated
            | PerSecondColumnsAggregated
            | IncreaseColumnsAggregated
            | DeltaColumnsAggregated => (
                args.len() >= 4 && args.len() % 2 == 0,
                "key, subkey and at least one function/value pair as",
            ),
            Rate | PerSecond | Increase | Delta => (!args.is_empty(), "at least 1"),
        };

        if valid {
            Ok(())
        } else {
            Err(CompileError::MacroArity {
                macro_name: self.name().to_string(),
                expected,
                args: args.to_vec(),
            })
        }
    }
}

/// How a bucketed value is compared with the previous bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Rate,
    PerSecond,
    Increase,
    Delta,
}

impl Change {
    fn suffix(self) -> &'static str {
        match self {
            Change::Rate => "Rate",
            Change::PerSecond => "PerSecond",
            Change::Increase => "Increase",
            Change::Delta => "Delta",
        }
    }
}

/// Macro expansion engine
#[derive(Debug, Clone, Copy, Default)]
pub struct Expander {
    /// Use `lagInFrame` window functions instead of `runningDifference`
    window: bool,
}

impl Expander {
    pub fn new(use_window_functions: bool) -> Self {
        Self {
            window: use_window_functions,
        }
    }

    /// Expand the highest priority macro of `ast`, or return `query` unchanged
    pub fn apply(&self, query: &str, ast: &Ast) -> Result<String> {
        let Some(kind) = AggregationMacro::PRIORITY
            .into_iter()
            .find(|m| ast.macros.contains_key(m.name()))
        else {
            return Ok(query.to_string());
        };
        debug!(macro_name = kind.name(), window = self.window, "expanding macro");

        let call = MacroCall::locate(query, kind.name())?;
        let args = match ast.macros.get(kind.name()) {
            Some(MacroArgs::List(items)) => items.clone(),
            _ => split_arguments(call.raw_args)?,
        };
        kind.check_arity(&args)?;

        let (body, tail) = split_tail(call.from_query)?;
        let filter = match kind {
            AggregationMacro::ColumnsMs => "$timeFilterMs",
            _ => "$timeFilter",
        };
        let parts = Parts {
            name: kind.name(),
            args,
            source: inject_time_filter(body, filter)?,
            tail,
        };

        let expanded = match kind {
            AggregationMacro::Columns => self.columns(&parts, "$timeSeries")?,
            AggregationMacro::ColumnsMs => self.columns(&parts, "$timeSeriesMs")?,
            AggregationMacro::RateColumns => self.rate_columns(&parts)?,
            AggregationMacro::Rate => self.rate(&parts)?,
            AggregationMacro::PerSecond => self.counters(&parts, Change::PerSecond),
            AggregationMacro::Increase => self.counters(&parts, Change::Increase),
            AggregationMacro::Delta => self.counters(&parts, Change::Delta),
            AggregationMacro::PerSecondColumns => {
                self.counter_columns(&parts, Change::PerSecond, "perSecondColumns")?
            }
            AggregationMacro::IncreaseColumns => {
                self.counter_columns(&parts, Change::Increase, "increaseColumns")?
            }
            AggregationMacro::DeltaColumns => {
                self.counter_columns(&parts, Change::Delta, "deltaColumns")?
            }
            AggregationMacro::RateColumnsAggregated => {
                self.columns_aggregated(&parts, Change::Rate)?
            }
            AggregationMacro::PerSecondColumnsAggregated => {
                self.columns_aggregated(&parts, Change::PerSecond)?
            }
            AggregationMacro::IncreaseColumnsAggregated => {
                self.columns_aggregated(&parts, Change::Increase)?
            }
            AggregationMacro::DeltaColumnsAggregated => {
                self.columns_aggregated(&parts, Change::Delta)?
            }
        };

        let format = parts
            .tail
            .format
            .as_ref()
            .map(|format| format!(" FORMAT {format}"))
            .unwrap_or_default();
        Ok(format!("{}{expanded}{format}", call.before))
    }

    /// `$rate(a AS x, ...)`: each alias divided by the bucket length
    fn rate(&self, parts: &Parts) -> Result<String> {
        let rates = parts
            .args
            .iter()
            .map(|arg| {
                let (_, alias) = aliased(parts.name, arg)?;
                Ok(format!(
                    "{} {alias}Rate",
                    self.counter(&alias, Change::Rate, None)
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(format!(
            "SELECT t, {} FROM (SELECT $timeSeries AS t, {} {})",
            rates.join(", "),
            parts.args.join(", "),
            parts.source_with_tail("t", "t"),
        ))
    }

    /// `$perSecond` / `$increase` / `$delta`: per argument `max()` differenced
    /// against the previous bucket
    fn counters(&self, parts: &Parts, change: Change) -> String {
        let mut inner = Vec::with_capacity(parts.args.len());
        let mut outer = Vec::with_capacity(parts.args.len());
        for (i, arg) in parts.args.iter().enumerate() {
            let column = format!("max_{i}");
            outer.push(format!(
                "{} AS {column}_{}",
                self.counter(&column, change, None),
                change.suffix()
            ));
            inner.push(format!("max({arg}) AS {column}"));
        }

        format!(
            "SELECT t, {} FROM (SELECT $timeSeries AS t, {} {})",
            outer.join(", "),
            inner.join(", "),
            parts.source_with_tail("t", "t"),
        )
    }

    /// `$columns(key, value)`: one `(key, value)` array per time bucket
    fn columns(&self, parts: &Parts, series: &str) -> Result<String> {
        let (key, value) = (&parts.args[0], &parts.args[1]);
        let (_, key_alias) = aliased(parts.name, key)?;
        let (_, value_alias) = aliased(parts.name, value)?;
        let by_key = format!("t, {key_alias}");

        Ok(format!(
            "SELECT t, groupArray(({key_alias}, {value_alias})) AS groupArr \
             FROM (SELECT {series} AS t, {key}, {value} {}) GROUP BY t ORDER BY t",
            parts.source_with_tail(&by_key, &by_key),
        ))
    }

    /// `$rateColumns(key, value)`: `$columns` with every value divided by the
    /// bucket length
    fn rate_columns(&self, parts: &Parts) -> Result<String> {
        let pivot = self.columns(parts, "$timeSeries")?;
        if self.window {
            Ok(format!(
                "SELECT t, arrayMap(a -> (a.1, a.2/dt), groupArr) \
                 FROM (SELECT t, groupArr, {} AS dt FROM ({pivot}))",
                self.elapsed()
            ))
        } else {
            Ok(format!(
                "SELECT t, arrayMap(a -> (a.1, a.2/{}), groupArr) FROM ({pivot})",
                self.elapsed()
            ))
        }
    }

    /// `$perSecondColumns` / `$increaseColumns` / `$deltaColumns(key, value)`
    fn counter_columns(&self, parts: &Parts, change: Change, default_alias: &str) -> Result<String> {
        let (key, value) = (&parts.args[0], &parts.args[1]);
        let (key, alias) = match split_alias(key)? {
            Some((_, alias)) => (key.clone(), alias),
            None => (
                format!("{key} AS {default_alias}"),
                default_alias.to_string(),
            ),
        };

        let column = format!("max_0_{}", change.suffix());
        let computed = self.counter("max_0", change, Some(self.changed(&alias)));
        let source = parts.source_with_tail(&format!("t, {alias}"), &format!("{alias}, t"));

        Ok(format!(
            "SELECT t, groupArray(({alias}, {column})) AS groupArr \
             FROM (SELECT t, {alias}, {computed} AS {column} \
             FROM (SELECT $timeSeries AS t, {key}, max({value}) AS max_0 {source})) \
             GROUP BY t ORDER BY t"
        ))
    }

    /// `$...ColumnsAggregated(key, subkey, fn1, value1, ...)`: per subkey
    /// change, re-aggregated over subkeys with each `fn`
    fn columns_aggregated(&self, parts: &Parts, change: Change) -> Result<String> {
        let (key, subkey) = (&parts.args[0], &parts.args[1]);
        let (_, key_alias) = aliased(parts.name, key)?;
        let (_, sub_alias) = aliased(parts.name, subkey)?;
        let reset = format!("{} OR {}", self.changed(&key_alias), self.changed(&sub_alias));
        let suffix = change.suffix();

        let mut inner = Vec::new();
        let mut middle = Vec::new();
        let mut outer = Vec::new();
        for (i, pair) in parts.args[2..].chunks(2).enumerate() {
            let [function, value] = pair else {
                continue;
            };
            let (expr, alias) = aliased(parts.name, value)?;
            let column = format!("max_{i}");
            inner.push(format!("max({expr}) AS {column}"));
            middle.push(format!(
                "{} AS {alias}{suffix}",
                self.counter(&column, change, Some(reset.clone()))
            ));
            outer.push(format!("{function}({alias}{suffix}) AS {alias}{suffix}Agg"));
        }

        let group = parts
            .tail
            .group_by
            .clone()
            .unwrap_or_else(|| format!("t, {key_alias}, {sub_alias}"));
        let order = parts
            .tail
            .order_by
            .clone()
            .unwrap_or_else(|| format!("{key_alias}, {sub_alias}, t"));
        let having = parts
            .tail
            .having
            .as_ref()
            .map(|having| format!(" HAVING {having}"))
            .unwrap_or_default();

        Ok(format!(
            "SELECT t, {key_alias}, {} \
             FROM (SELECT t, {key_alias}, {sub_alias}, {} \
             FROM (SELECT $timeSeries AS t, {key}, {subkey}, {} {})) \
             GROUP BY t, {key_alias}{having} ORDER BY t, {key_alias}",
            outer.join(", "),
            middle.join(", "),
            inner.join(", "),
            append(
                &parts.source,
                &format!("GROUP BY {group} ORDER BY {order}{}", parts.tail.limits())
            ),
        ))
    }

    /// Change of `column` since the previous row. `reset` is a condition under
    /// which the previous row belongs to another series.
    fn counter(&self, column: &str, change: Change, reset: Option<String>) -> String {
        let diff = self.difference(column);
        let elapsed = self.elapsed();
        let or_reset = reset
            .as_ref()
            .map(|reset| format!(" OR {reset}"))
            .unwrap_or_default();

        match (change, reset) {
            (Change::Rate, None) => format!("{column}/{elapsed}"),
            (Change::Rate, Some(reset)) => format!("if({reset}, nan, {column}/{elapsed})"),
            (Change::PerSecond, _) => {
                format!("if({diff} < 0{or_reset}, nan, {diff} / {elapsed})")
            }
            (Change::Increase, _) => format!("if({diff} < 0{or_reset}, 0, {diff})"),
            (Change::Delta, None) => diff,
            (Change::Delta, Some(reset)) => format!("if({reset}, 0, {diff})"),
        }
    }

    fn difference(&self, column: &str) -> String {
        if self.window {
            format!("({column} - lagInFrame({column}, 1, {column}) OVER ())")
        } else {
            format!("runningDifference({column})")
        }
    }

    /// Seconds since the previous bucket
    fn elapsed(&self) -> String {
        if self.window {
            "((t - lagInFrame(t, 1, t) OVER ()) / 1000)".to_string()
        } else {
            "runningDifference(t/1000)".to_string()
        }
    }

    fn changed(&self, column: &str) -> String {
        if self.window {
            format!("lagInFrame({column}, 1, {column}) OVER () != {column}")
        } else {
            format!("neighbor({column}, -1, {column}) != {column}")
        }
    }
}

/// A macro invocation located in the query text
#[derive(Debug)]
struct MacroCall<'a> {
    /// Everything ahead of the macro, comments included
    before: &'a str,
    raw_args: &'a str,
    /// From the first top-level FROM after the call to the end
    from_query: &'a str,
}

impl<'a> MacroCall<'a> {
    fn locate(query: &'a str, name: &str) -> Result<Self> {
        let missing = || CompileError::FromClauseMissing {
            macro_name: name.to_string(),
            query: query.to_string(),
        };

        let mut lexer = Lexer::new(query);
        while let Some(token) = lexer.next_token()? {
            if token.kind != TokenKind::MacroFunction || token.text != name {
                continue;
            }
            let open = lexer.expect_next("(")?;
            if !open.is_open_paren() {
                return Err(CompileError::Syntax {
                    expected: format!("( after {name}"),
                    found: open.text.to_string(),
                    remaining: lexer.remaining().to_string(),
                });
            }
            let raw_args = between_braces(lexer.remaining())?;
            let rest = &query[open.end() + raw_args.len() + 1..];
            let from = find_keyword(rest, &["from"])?.ok_or_else(missing)?;

            return Ok(Self {
                before: &query[..token.offset],
                raw_args,
                from_query: rest[from.offset..].trim(),
            });
        }
        Err(missing())
    }
}

/// Clauses trailing the macro's FROM text
#[derive(Debug, Default, PartialEq)]
struct Tail {
    group_by: Option<String>,
    having: Option<String>,
    order_by: Option<String>,
    limit: Option<String>,
    settings: Option<String>,
    /// Applies to the whole expanded query, not the bucketing subquery
    format: Option<String>,
}

impl Tail {
    fn render(&self, group_by: &str, order_by: &str) -> String {
        let mut out = format!("GROUP BY {}", self.group_by.as_deref().unwrap_or(group_by));
        if let Some(having) = &self.having {
            out.push_str(" HAVING ");
            out.push_str(having);
        }
        out.push_str(" ORDER BY ");
        out.push_str(self.order_by.as_deref().unwrap_or(order_by));
        out.push_str(&self.limits());
        out
    }

    /// LIMIT and SETTINGS, each with a leading space
    fn limits(&self) -> String {
        let mut out = String::new();
        if let Some(limit) = &self.limit {
            out.push_str(" LIMIT ");
            out.push_str(limit);
        }
        if let Some(settings) = &self.settings {
            out.push_str(" SETTINGS ");
            out.push_str(settings);
        }
        out
    }
}

struct Parts {
    name: &'static str,
    args: Vec<String>,
    /// FROM text with the time filter applied, without its trailing clauses
    source: String,
    tail: Tail,
}

impl Parts {
    fn source_with_tail(&self, group_by: &str, order_by: &str) -> String {
        append(&self.source, &self.tail.render(group_by, order_by))
    }
}

/// Cut top-level GROUP BY / HAVING / ORDER BY / LIMIT / SETTINGS / FORMAT
/// off `from_query`
fn split_tail(from_query: &str) -> Result<(&str, Tail)> {
    const ORDER: [&str; 6] = ["group by", "having", "order by", "limit", "settings", "format"];
    let rank = |keyword: &str| ORDER.iter().position(|k| *k == keyword).unwrap_or(ORDER.len());

    let found: Vec<(Token<'_>, String)> = top_level_tokens(from_query)?
        .into_iter()
        .filter_map(|token| {
            let keyword = token.keyword();
            let is_clause = match token.kind {
                TokenKind::Statement => ORDER.contains(&keyword.as_str()),
                // SETTINGS is not a clause keyword for the parser
                TokenKind::Identifier => keyword == "settings",
                _ => false,
            };
            is_clause.then_some((token, keyword))
        })
        .collect();
    let Some((first, _)) = found.first() else {
        return Ok((from_query, Tail::default()));
    };

    let mut tail = Tail::default();
    for (i, (token, keyword)) in found.iter().enumerate() {
        if i > 0 {
            let previous = &found[i - 1].1;
            if rank(previous) >= rank(keyword) {
                return Err(CompileError::ClauseOrder {
                    clause: keyword.to_uppercase(),
                    previous: previous.to_uppercase(),
                });
            }
        }

        let end = found.get(i + 1).map_or(from_query.len(), |(next, _)| next.offset);
        let text = Some(from_query[token.end()..end].trim().to_string());
        match keyword.as_str() {
            "group by" => tail.group_by = text,
            "having" => tail.having = text,
            "order by" => tail.order_by = text,
            "limit" => tail.limit = text,
            "settings" => tail.settings = text,
            _ => tail.format = text,
        }
    }
    Ok((&from_query[..first.offset], tail))
}

/// Add `filter` to the FROM text: inside every UNION ALL branch of a
/// `FROM (subquery)`, otherwise to the statement itself
fn inject_time_filter(from_query: &str, filter: &str) -> Result<String> {
    let tokens = top_level_tokens(from_query)?;
    let start = match tokens.as_slice() {
        [from, open, ..] if from.keyword() == "from" && open.is_open_paren() => open.end(),
        _ => return filter_statement(from_query, filter),
    };

    let body = between_braces(&from_query[start..])?;
    let branches = split_union_all(body)?
        .into_iter()
        .map(|branch| filter_statement(branch, filter))
        .collect::<Result<Vec<_>>>()?;

    Ok(format!(
        "{}{}{}",
        &from_query[..start],
        branches.join("UNION ALL"),
        &from_query[start + body.len()..]
    ))
}

/// `WHERE x` becomes `WHERE filter AND x`; without a WHERE one is added
/// ahead of any trailing clause
fn filter_statement(statement: &str, filter: &str) -> Result<String> {
    let tokens = top_level_tokens(statement)?;
    let find = |names: &[&str]| {
        tokens.iter().find(|token| {
            token.kind == TokenKind::Statement && names.contains(&token.keyword().as_str())
        })
    };

    if let Some(token) = find(&["where"]) {
        return Ok(format!(
            "{} {filter} AND{}",
            &statement[..token.end()],
            &statement[token.end()..]
        ));
    }

    let condition = format!("WHERE {filter}");
    match find(&["group by", "having", "order by", "limit", "format"]) {
        Some(token) => Ok(format!(
            "{} {}",
            append(&statement[..token.offset], &condition),
            &statement[token.offset..]
        )),
        None => {
            let content = statement.trim_end();
            Ok(format!(
                "{}{}",
                append(content, &condition),
                &statement[content.len()..]
            ))
        }
    }
}

/// Alias of a macro argument: `expr AS alias`, or a bare column name
fn aliased(macro_name: &str, arg: &str) -> Result<(String, String)> {
    if let Some(pair) = split_alias(arg)? {
        return Ok(pair);
    }
    match tokenize(arg)?.as_slice() {
        [token] if token.kind == TokenKind::Identifier => {
            Ok((token.text.to_string(), token.text.to_string()))
        }
        _ => Err(CompileError::UnaliasedArgument {
            macro_name: macro_name.to_string(),
            argument: arg.trim().to_string(),
        }),
    }
}

/// `head tail`, on a new line when `head` ends in a line comment
fn append(head: &str, tail: &str) -> String {
    let head = head.trim_end();
    if ends_with_line_comment(head) {
        format!("{head}\n{tail}")
    } else {
        format!("{head} {tail}")
    }
}
