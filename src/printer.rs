//! Canonical SQL rendering of a clause tree
//!
//! Output is the structural inverse of the parser, not of the original text:
//! one clause per line, nested queries indented by one level.

use crate::ast::{Ast, Clause, Join, MacroArgs, Source};
use crate::fragment::ends_with_line_comment;
use crate::lexer::Lexer;

/// One indentation level
pub const TAB: &str = "    ";

/// Render a clause tree as SQL
pub fn print_ast(ast: &Ast) -> String {
    print_indented(ast, "")
}

pub(crate) fn print_indented(ast: &Ast, tab: &str) -> String {
    let nested = format!("{tab}{TAB}");
    let mut out: Vec<String> = Vec::new();

    for comment in &ast.root {
        out.push(format!("{tab}{}", comment.trim_end()));
    }

    for (name, args) in &ast.macros {
        match args {
            MacroArgs::List(items) => out.push(format!("{tab}{name}({})", items.join(", "))),
            MacroArgs::Tree(tree) => out.push(format!(
                "{tab}{name}(\n{}\n{tab})",
                print_indented(tree, &nested)
            )),
        }
    }

    print_clause(&mut out, ast, Clause::With, tab);
    if ast.select.as_ref().is_some_and(|items| !items.is_empty()) {
        print_clause(&mut out, ast, Clause::Select, tab);
    }

    match &ast.from {
        Some(Source::Table(items)) => print_items(&mut out, tab, "FROM", items, ","),
        Some(Source::Subquery(sub)) => {
            let mut line = format!("{tab}FROM (\n{}\n{tab})", print_indented(sub, &nested));
            for alias in ast.aliases.iter().flatten() {
                line = glue(line, alias);
            }
            out.push(line);
        }
        None => {}
    }

    for join in &ast.joins {
        out.push(print_join(join, tab));
    }

    for clause in [
        Clause::Prewhere,
        Clause::Where,
        Clause::GroupBy,
        Clause::Having,
        Clause::OrderBy,
        Clause::Limit,
    ] {
        print_clause(&mut out, ast, clause, tab);
    }

    for branch in ast.union_all.iter().flatten() {
        out.push(format!("{tab}UNION ALL"));
        out.push(print_indented(branch, tab));
    }

    print_clause(&mut out, ast, Clause::Format, tab);

    out.join("\n")
}

fn print_clause(out: &mut Vec<String>, ast: &Ast, clause: Clause, tab: &str) {
    let Some(items) = ast.items(&clause) else {
        return;
    };
    let keyword = clause.name().to_uppercase();
    if clause.is_predicate() {
        print_items(out, tab, &keyword, &fold_markers(items), "");
    } else {
        print_items(out, tab, &keyword, items, ",");
    }
}

/// Attach `,` markers to the predicate before them
fn fold_markers(items: &[String]) -> Vec<String> {
    let mut folded: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        match folded.last_mut() {
            Some(last) if item == "," => *last = with_separator(last, ","),
            _ => folded.push(item.clone()),
        }
    }
    folded
}

fn print_items(out: &mut Vec<String>, tab: &str, keyword: &str, items: &[String], separator: &str) {
    match items {
        [] => out.push(format!("{tab}{keyword}")),
        [item] => out.push(glue(format!("{tab}{keyword}"), item)),
        _ => {
            out.push(format!("{tab}{keyword}"));
            let last = items.len() - 1;
            for (i, item) in items.iter().enumerate() {
                let item = if i < last {
                    with_separator(item, separator)
                } else {
                    item.trim_end().to_string()
                };
                out.push(format!("{tab}{TAB}{item}"));
            }
        }
    }
}

fn print_join(join: &Join, tab: &str) -> String {
    let mut line = format!("{tab}{}", join.kind.to_uppercase());
    match &join.source {
        Source::Table(items) => {
            let last = items.len().saturating_sub(1);
            for (i, item) in items.iter().enumerate() {
                let item = if i < last { with_separator(item, ",") } else { item.clone() };
                line = glue(line, &item);
            }
        }
        Source::Subquery(sub) => {
            let nested = format!("{tab}{TAB}");
            line = glue(line, &format!("(\n{}\n{tab})", print_indented(sub, &nested)));
        }
    }
    for alias in &join.aliases {
        line = glue(line, alias);
    }
    if !join.using.is_empty() {
        line = glue(line, &format!("USING ({})", join.using.join(", ")));
    }
    if !join.on.is_empty() {
        line = glue(line, "ON");
        for predicate in &join.on {
            line = glue(line, predicate);
        }
    }
    line
}

/// Join with a space, or a newline when `head` ends in a line comment
fn glue(head: String, tail: &str) -> String {
    let tail = tail.trim_end();
    if tail.is_empty() {
        return head;
    }
    if ends_with_line_comment(&head) {
        format!("{}\n{tail}", head.trim_end())
    } else {
        format!("{head} {tail}")
    }
}

/// Append `separator`, placing it before a trailing `--` comment
fn with_separator(item: &str, separator: &str) -> String {
    let item = item.trim_end();
    let comment = Lexer::new(item)
        .filter_map(|token| token.ok())
        .last()
        .filter(|token| token.is_line_comment());

    match comment {
        Some(comment) => format!(
            "{}{separator} {}",
            item[..comment.offset].trim_end(),
            comment.text
        ),
        None => format!("{item}{separator}"),
    }
}
