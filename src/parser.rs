use tracing::trace;

use crate::ast::{Ast, Clause, Join, MacroArgs, Source};
use crate::error::{CompileError, Result};
use crate::fragment::{between_braces, split_arguments, split_union_all};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::printer::{TAB, print_indented};

/// Table functions whose parenthesized arguments are kept as one FROM fragment
const TABLE_FUNCTIONS: &[&str] = &[
    "remote",
    "remotesecure",
    "cluster",
    "clusterallreplicas",
    "file",
    "url",
    "numbers",
    "numbers_mt",
    "zeros",
    "merge",
    "mysql",
    "postgresql",
    "jdbc",
    "odbc",
    "hdfs",
    "s3",
    "s3cluster",
    "input",
    "generaterandom",
    "dictionary",
    "values",
    "view",
];

/// Words after which an opening parenthesis starts a group, not a call
const SPACED_WORDS: &[&str] = &[
    "and", "or", "not", "in", "as", "when", "then", "else", "case", "by", "on", "using", "exists",
    "like", "ilike", "between", "is", "interval", "over", "distinct",
];

/// Parse a query into its clause tree
pub fn parse_query(input: &str) -> Result<Ast> {
    Parser::new(input).parse()
}

/// Single-pass clause tree builder.
///
/// Owns the token cursor for one query string; nested subqueries, macro
/// arguments and UNION ALL branches are parsed by fresh parsers.
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    /// Token read ahead by a sub-parser and handed back to the main loop
    pending: Option<Token<'a>>,
    tree: Ast,
    clause: Clause,
    fragment: Fragment,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            lexer: Lexer::new(input),
            pending: None,
            tree: Ast::default(),
            clause: Clause::Root,
            fragment: Fragment::default(),
        }
    }

    pub fn parse(mut self) -> Result<Ast> {
        while let Some(token) = self.next()? {
            self.step(token)?;
        }
        self.flush();
        Ok(self.tree)
    }

    fn next(&mut self) -> Result<Option<Token<'a>>> {
        if let Some(token) = self.pending.take() {
            return Ok(Some(token));
        }
        self.lexer.next_token()
    }

    fn expect_next(&mut self, expected: &str) -> Result<Token<'a>> {
        if let Some(token) = self.pending.take() {
            return Ok(token);
        }
        self.lexer.expect_next(expected)
    }

    /// Consume a parenthesized span whose `(` was just read
    fn take_braces(&mut self) -> Result<&'a str> {
        let body = between_braces(self.lexer.remaining())?;
        self.lexer.advance(body.len() + 1);
        Ok(body)
    }

    fn step(&mut self, token: Token<'a>) -> Result<()> {
        let balanced = self.fragment.is_balanced();
        match token.kind {
            TokenKind::Statement if balanced => match Clause::from_keyword(&token.keyword()) {
                Some(clause) if !self.tree.has(&clause) => self.start_clause(clause)?,
                _ => self.fragment.push_token(&token),
            },
            TokenKind::Comment => self.fragment.push_comment(&token),
            TokenKind::Join if balanced => self.parse_join(token)?,
            TokenKind::MacroFunction if balanced => self.parse_macro(token)?,
            TokenKind::Punctuation if balanced && token.is_comma() => {
                self.flush();
                if self.clause == Clause::Where {
                    self.push_item(",".to_string());
                }
            }
            TokenKind::Open if balanced && token.is_open_paren() && self.clause == Clause::From => {
                self.parse_from_paren(token)?
            }
            TokenKind::Conjunction if self.clause.is_predicate() => {
                if balanced {
                    self.flush();
                }
                self.fragment.push_token(&token);
            }
            TokenKind::In => self.parse_in(token)?,
            _ => self.fragment.push_token(&token),
        }
        Ok(())
    }

    fn start_clause(&mut self, clause: Clause) -> Result<()> {
        self.flush();
        trace!(clause = %clause, "clause start");
        if clause == Clause::UnionAll {
            return self.parse_union_all();
        }
        self.tree.open(&clause);
        self.clause = clause;
        Ok(())
    }

    /// Everything after the first UNION ALL becomes a list of branch trees
    fn parse_union_all(&mut self) -> Result<()> {
        let rest = self.lexer.remaining();
        self.lexer.finish();

        let branches = split_union_all(rest)?
            .into_iter()
            .map(parse_query)
            .collect::<Result<Vec<_>>>()?;
        trace!(branches = branches.len(), "union all parsed");

        self.tree.union_all = Some(branches);
        self.clause = Clause::UnionAll;
        Ok(())
    }

    fn parse_macro(&mut self, token: Token<'a>) -> Result<()> {
        self.flush();
        let name = token.text.to_string();

        let open = self.expect_next("(")?;
        if !open.is_open_paren() {
            return Err(CompileError::Syntax {
                expected: format!("( after {name}"),
                found: open.text.to_string(),
                remaining: self.lexer.remaining().to_string(),
            });
        }

        let args = parse_query(self.take_braces()?)?;
        let args = if args.is_bare_root() {
            MacroArgs::List(args.root)
        } else {
            MacroArgs::Tree(Box::new(args))
        };
        trace!(macro_name = %name, "macro arguments parsed");

        self.tree.macros.insert(name, args);
        // The macro stands in for SELECT
        if self.tree.select.is_none() {
            self.tree.select = Some(Vec::new());
        }
        Ok(())
    }

    fn parse_from_paren(&mut self, token: Token<'a>) -> Result<()> {
        let table_function = is_table_function(&self.fragment.text);
        let from_is_empty = self
            .tree
            .items(&Clause::From)
            .is_none_or(|items| items.is_empty());

        if table_function {
            let body = self.take_braces()?;
            self.fragment.push_raw(&format!("({body})"));
        } else if self.fragment.is_empty() && from_is_empty {
            let sub = parse_query(self.take_braces()?)?;
            self.tree.from = Some(Source::Subquery(Box::new(sub)));
            self.clause = Clause::Aliases;
        } else {
            self.fragment.push_token(&token);
        }
        Ok(())
    }

    fn parse_in(&mut self, token: Token<'a>) -> Result<()> {
        self.fragment.push_token(&token);

        let Some(next) = self.next()? else {
            return Ok(());
        };
        if !next.is_open_paren() {
            self.pending = Some(next);
            return Ok(());
        }

        let set = parse_query(self.take_braces()?)?;
        if set.is_bare_root() {
            self.fragment.push_raw(&format!(" ({})", set.root.join(", ")));
        } else {
            self.fragment
                .push_raw(&format!(" (\n{}\n)", print_indented(&set, TAB)));
        }
        Ok(())
    }

    fn parse_join(&mut self, token: Token<'a>) -> Result<()> {
        self.flush();
        let mut join = Join::new(token.keyword());
        if join.kind.ends_with("array join") {
            join.source = Source::Table(self.parse_array_join(&token)?);
            trace!(kind = %join.kind, "join parsed");
            self.tree.joins.push(join);
            return Ok(());
        }

        let first = self.expect_next("join source")?;
        join.source = match first.kind {
            TokenKind::Open if first.is_open_paren() => {
                Source::Subquery(Box::new(parse_query(self.take_braces()?)?))
            }
            TokenKind::Identifier | TokenKind::String | TokenKind::MacroVariable => {
                Source::Table(vec![self.parse_join_table(first)?])
            }
            _ => {
                return Err(CompileError::Syntax {
                    expected: format!("source after {}", token.text),
                    found: first.text.to_string(),
                    remaining: self.lexer.remaining().to_string(),
                });
            }
        };

        let constraint = self.parse_join_aliases(&mut join)?;
        match constraint.map(|t| t.keyword()).as_deref() {
            Some("using") => self.parse_join_using(&mut join)?,
            Some("on") => self.parse_join_on(&mut join)?,
            _ => {}
        }

        trace!(kind = %join.kind, "join parsed");
        self.tree.joins.push(join);
        Ok(())
    }

    /// `ARRAY JOIN a AS x, b AS y`: every comma-separated item belongs to the join
    fn parse_array_join(&mut self, join: &Token<'a>) -> Result<Vec<String>> {
        let mut items = Vec::new();
        let mut fragment = Fragment::default();
        while let Some(token) = self.next()? {
            let balanced = fragment.is_balanced();
            match token.kind {
                TokenKind::Statement | TokenKind::Join | TokenKind::JoinConstraint if balanced => {
                    self.pending = Some(token);
                    break;
                }
                TokenKind::Punctuation if balanced && token.is_comma() => {
                    items.extend(fragment.take());
                }
                TokenKind::Comment => fragment.push_comment(&token),
                _ => fragment.push_token(&token),
            }
        }
        items.extend(fragment.take());

        if items.is_empty() {
            return Err(CompileError::Syntax {
                expected: format!("arrays after {}", join.text),
                found: String::new(),
                remaining: self.lexer.remaining().to_string(),
            });
        }
        Ok(items)
    }

    /// `db.table`, `table` or `tableFunction(args)`
    fn parse_join_table(&mut self, first: Token<'a>) -> Result<String> {
        let mut source = Fragment::default();
        source.push_token(&first);

        while let Some(token) = self.next()? {
            let dotted = token.text == "." || source.text.ends_with('.');
            if dotted && token.kind != TokenKind::Comment {
                source.push_token(&token);
            } else if token.is_open_paren() && !source.text.ends_with(')') {
                let body = self.take_braces()?;
                source.push_raw(&format!("({body})"));
            } else {
                self.pending = Some(token);
                break;
            }
        }
        Ok(source.text)
    }

    /// Collect aliases; returns the USING / ON token if one follows
    fn parse_join_aliases(&mut self, join: &mut Join) -> Result<Option<Token<'a>>> {
        while let Some(token) = self.next()? {
            match token.kind {
                TokenKind::JoinConstraint => return Ok(Some(token)),
                TokenKind::Join | TokenKind::Statement => {
                    self.pending = Some(token);
                    return Ok(None);
                }
                _ if token.is_comma() => {
                    self.pending = Some(token);
                    return Ok(None);
                }
                _ => join.aliases.push(token.text.to_string()),
            }
        }
        Ok(None)
    }

    fn parse_join_using(&mut self, join: &mut Join) -> Result<()> {
        let first = self.expect_next("USING columns")?;
        if first.is_open_paren() {
            join.using = split_arguments(self.take_braces()?)?;
            return Ok(());
        }

        // Unparenthesized: USING a, b
        let mut token = Some(first);
        while let Some(current) = token {
            match current.kind {
                TokenKind::Identifier | TokenKind::String => {
                    join.using.push(current.text.to_string())
                }
                _ if current.is_comma() => {}
                _ => {
                    self.pending = Some(current);
                    break;
                }
            }
            token = self.next()?;
        }
        Ok(())
    }

    fn parse_join_on(&mut self, join: &mut Join) -> Result<()> {
        let mut fragment = Fragment::default();
        while let Some(token) = self.next()? {
            let balanced = fragment.is_balanced();
            match token.kind {
                TokenKind::Statement | TokenKind::Join if balanced => {
                    self.pending = Some(token);
                    break;
                }
                TokenKind::Conjunction if balanced => {
                    if let Some(item) = fragment.take() {
                        join.on.push(item);
                    }
                    fragment.push_token(&token);
                }
                TokenKind::Comment => fragment.push_comment(&token),
                _ => fragment.push_token(&token),
            }
        }
        if let Some(item) = fragment.take() {
            join.on.push(item);
        }

        if join.on.is_empty() {
            return Err(CompileError::Syntax {
                expected: "join condition after ON".to_string(),
                found: String::new(),
                remaining: self.lexer.remaining().to_string(),
            });
        }
        Ok(())
    }

    /// Push the current fragment into the active clause
    fn flush(&mut self) {
        let comment_only = !self.fragment.has_code;
        if let Some(item) = self.fragment.take() {
            // Comments with nothing after them stay attached to the previous item
            if comment_only {
                let clause = self.clause.clone();
                if let Some(last) = self.tree.items_mut(&clause).and_then(|i| i.last_mut()) {
                    last.push(' ');
                    last.push_str(&item);
                    return;
                }
            }
            self.push_item(item);
        }
    }

    fn push_item(&mut self, item: String) {
        let clause = self.clause.clone();
        match self.tree.items_mut(&clause) {
            Some(items) => items.push(item),
            None => self.tree.root.push(item),
        }
    }
}

/// Expression text accumulated between clause boundaries
#[derive(Debug, Default)]
struct Fragment {
    text: String,
    /// Open minus close parentheses pushed so far
    depth: i32,
    /// Anything other than comments was pushed
    has_code: bool,
    trailing_line_comment: bool,
}

impl Fragment {
    fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    fn is_balanced(&self) -> bool {
        self.depth <= 0
    }

    fn push_token(&mut self, token: &Token) {
        if token.is_open_paren() {
            self.depth += 1;
        } else if token.is_close_paren() {
            self.depth -= 1;
        }
        if needs_space(&self.text, token) {
            self.text.push(' ');
        }
        self.text.push_str(token.text);
        self.has_code = true;
        self.trailing_line_comment = false;
    }

    /// Comments end with a newline so they stay attached to what follows
    fn push_comment(&mut self, token: &Token) {
        if self.text.chars().last().is_some_and(|c| !c.is_whitespace()) {
            self.text.push(' ');
        }
        self.text.push_str(token.text);
        self.text.push('\n');
        self.trailing_line_comment = token.is_line_comment();
    }

    /// Append already formatted text; it must be parenthesis-balanced
    fn push_raw(&mut self, raw: &str) {
        self.text.push_str(raw);
        self.has_code = true;
        self.trailing_line_comment = false;
    }

    fn take(&mut self) -> Option<String> {
        let taken = std::mem::take(self);
        let mut text = taken.text.trim().to_string();
        if text.is_empty() {
            return None;
        }
        if taken.trailing_line_comment {
            text.push('\n');
        }
        Some(text)
    }
}

/// Whether a space goes between `text` and the next token
fn needs_space(text: &str, token: &Token) -> bool {
    let Some(last) = text.chars().last() else {
        return false;
    };
    if last.is_whitespace() || matches!(last, '(' | '[' | '.' | '!') {
        return false;
    }
    match token.kind {
        TokenKind::Close => false,
        TokenKind::Punctuation if matches!(token.text, "," | ";") => false,
        _ if token.text.starts_with('.') => !attaches(last),
        TokenKind::Open => !attaches(last) || ends_with_spaced_word(text),
        _ => true,
    }
}

/// Characters a following `(`, `[` or `.` binds to without a space
fn attaches(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | ')' | ']' | '`' | '"')
}

fn ends_with_spaced_word(text: &str) -> bool {
    let word = trailing_word(text).to_lowercase();
    SPACED_WORDS.contains(&word.as_str())
}

fn trailing_word(text: &str) -> &str {
    text.rsplit(|c: char| !(c.is_alphanumeric() || c == '_'))
        .next()
        .unwrap_or("")
}

fn is_table_function(text: &str) -> bool {
    let word = trailing_word(text.trim()).to_lowercase();
    !word.is_empty() && TABLE_FUNCTIONS.contains(&word.as_str())
}
