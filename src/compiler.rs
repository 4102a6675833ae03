//! Query compilation pipeline
//!
//! Conditionals, interpolation, parse, ad-hoc filters, macro expansion and
//! placeholder substitution, in that order.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::debug;

use crate::adhoc::{self, Target};
use crate::config::CompileRequest;
use crate::error::Result;
use crate::fragment::{find_call, strip_comments};
use crate::parser::parse_query;
use crate::printer::print_ast;
use crate::processor::Expander;
use crate::template::{interpolate, resolve_conditionals, unescape};
use crate::time::{self, date_filter, time_filter64_by_column, time_filter_by_column};

static PLAIN_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][0-9a-zA-Z_]+$").expect("valid regex"));

static ADHOC_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$adhoc\b").expect("valid regex"));

/// Placeholders that expand to expressions over other placeholders
static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(timeSeriesMs|timeSeries|naturalTimeSeries|timeFilterMs|timeFilter)\b")
        .expect("valid regex")
});

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(__from|__to|__interval_ms|table|dateTimeCol|dateCol|adhoc|from|to|interval)\b")
        .expect("valid regex")
});

/// Compile `raw` against `request`
pub fn compile(raw: &str, request: &CompileRequest) -> Result<String> {
    Compiler::new(request).compile(raw)
}

/// Compiles query templates against one request
#[derive(Debug, Clone)]
pub struct Compiler<'r> {
    request: &'r CompileRequest,
    expander: Expander,
}

impl<'r> Compiler<'r> {
    pub fn new(request: &'r CompileRequest) -> Self {
        Self {
            request,
            expander: Expander::new(request.options.use_window_functions),
        }
    }

    pub fn compile(&self, raw: &str) -> Result<String> {
        let variables = &self.request.variables;

        let query = resolve_conditionals(raw, variables)?;
        let query = interpolate(&query, variables);
        debug!(query = %query, "interpolated");

        let mut ast = parse_query(&query)?;

        let options = &self.request.options;
        let target = Target::resolve(&ast, &options.database, &options.table);
        let conditions = adhoc::conditions(&self.request.ad_hoc_filters, target.as_ref());
        let (query, adhoc) = if conditions.is_empty() || ADHOC_PLACEHOLDER.is_match(&query) {
            (query, adhoc::render(&conditions))
        } else {
            adhoc::inject(&mut ast, &conditions);
            debug!(filters = conditions.len(), "ad-hoc filters injected");
            (print_ast(&ast), adhoc::render(&[]))
        };

        let query = self.expander.apply(&query, &ast)?;
        let query = self.substitute(&query, &adhoc)?;
        debug!(query = %query, "placeholders substituted");

        if options.skip_comments {
            return strip_comments(&query);
        }
        Ok(query)
    }

    fn substitute(&self, query: &str, adhoc: &str) -> Result<String> {
        let options = &self.request.options;
        let range = &self.request.time_range;

        let query = unescape(query)?;
        let query = replace_calls(&query, "$timeFilterByColumn", time_filter_by_column)?;
        let query = replace_calls(&query, "$timeFilter64ByColumn", time_filter64_by_column)?;

        let interval = time::interval_seconds(&options.interval, options.interval_factor)?;
        let interval_ms = time::interval_ms(&options.interval, options.interval_factor)?;
        let round = time::round_seconds(options.round.as_deref(), interval)?;
        let window = range.window(round)?;
        let date_time_type = options.date_time_type;

        let query = EXPRESSION.replace_all(&query, |caps: &Captures| match &caps[1] {
            "timeSeries" => date_time_type.time_series().to_string(),
            "timeSeriesMs" => date_time_type.time_series_ms().to_string(),
            "naturalTimeSeries" => date_time_type.natural_time_series(range),
            "timeFilterMs" => self.date_prefix(true) + &date_time_type.time_filter_ms(range.to_now),
            _ => self.date_prefix(false) + &date_time_type.time_filter(range.to_now),
        });

        let query = PLACEHOLDER.replace_all(&query, |caps: &Captures| match &caps[1] {
            "__from" => window.from_ms.to_string(),
            "__to" => window.to_ms.to_string(),
            "__interval_ms" => interval_ms.to_string(),
            "table" => self.table(),
            "dateTimeCol" => escape_identifier(&options.date_time_column, '"'),
            "dateCol" => escape_identifier(options.date_column.as_deref().unwrap_or_default(), '"'),
            "adhoc" => adhoc.to_string(),
            "from" => window.from.to_string(),
            "to" => window.to.to_string(),
            _ => interval.to_string(),
        });

        Ok(query.into_owned())
    }

    /// `Date` column bounds prepended to time filters, when configured
    fn date_prefix(&self, millis: bool) -> String {
        match &self.request.options.date_column {
            Some(column) if !column.is_empty() => date_filter(self.request.time_range.to_now, millis),
            _ => String::new(),
        }
    }

    fn table(&self) -> String {
        let options = &self.request.options;
        if options.database.is_empty() {
            escape_identifier(&options.table, '`')
        } else {
            format!(
                "{}.{}",
                escape_identifier(&options.database, '`'),
                escape_identifier(&options.table, '`')
            )
        }
    }
}

/// Replace every `$name(arg)` call with `render(arg)`
fn replace_calls(query: &str, name: &str, render: impl Fn(&str) -> String) -> Result<String> {
    let mut query = query.to_string();
    loop {
        let Some((start, end, args)) = find_call(&query, name)? else {
            break;
        };
        let replacement = render(args.trim());
        query.replace_range(start..end, &replacement);
    }
    Ok(query)
}

/// Quote an identifier unless it is a plain name
fn escape_identifier(name: &str, quote: char) -> String {
    if PLAIN_IDENTIFIER.is_match(name) {
        name.to_string()
    } else {
        let escaped = name.replace(quote, &format!("\\{quote}"));
        format!("{quote}{escaped}{quote}")
    }
}
