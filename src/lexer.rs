use pest::Parser;
use pest_derive::Parser;

use crate::error::{CompileError, Result};

#[derive(Parser)]
#[grammar = "src/grammar.pest"]
struct TokenGrammar;

/// Category of a lexed token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Clause keyword: SELECT, FROM, GROUP BY, UNION ALL, ...
    Statement,
    /// Join phrase: JOIN, GLOBAL ANY LEFT JOIN, ARRAY JOIN, ...
    Join,
    /// USING or ON following a join source
    JoinConstraint,
    /// AND / OR
    Conjunction,
    /// IN, NOT IN, GLOBAL IN, GLOBAL NOT IN
    In,
    Identifier,
    String,
    Number,
    Operator,
    /// `(` or `[`
    Open,
    /// `)` or `]`
    Close,
    /// `,` `:` `?` `;` `{` `}`
    Punctuation,
    /// Aggregation macro name such as `$rate`
    MacroFunction,
    /// Any other `$name`
    MacroVariable,
    Comment,
    Whitespace,
}

impl TokenKind {
    fn from_rule(rule: Rule) -> Option<Self> {
        let kind = match rule {
            Rule::whitespace => TokenKind::Whitespace,
            Rule::line_comment | Rule::block_comment => TokenKind::Comment,
            Rule::macro_function => TokenKind::MacroFunction,
            Rule::statement => TokenKind::Statement,
            Rule::join_phrase => TokenKind::Join,
            Rule::join_constraint => TokenKind::JoinConstraint,
            Rule::conjunction => TokenKind::Conjunction,
            Rule::in_operator => TokenKind::In,
            Rule::macro_variable => TokenKind::MacroVariable,
            Rule::string => TokenKind::String,
            Rule::number => TokenKind::Number,
            Rule::identifier => TokenKind::Identifier,
            Rule::operator => TokenKind::Operator,
            Rule::open_bracket => TokenKind::Open,
            Rule::close_bracket => TokenKind::Close,
            Rule::punctuation => TokenKind::Punctuation,
            _ => return None,
        };
        Some(kind)
    }
}

/// A lexed span of the input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    /// Byte offset of the token in the lexer's input
    pub offset: usize,
}

impl<'a> Token<'a> {
    /// Byte offset just past the token
    pub fn end(&self) -> usize {
        self.offset + self.text.len()
    }

    /// Lowercased text with inner whitespace collapsed, e.g. `GROUP\n BY` -> `group by`
    pub fn keyword(&self) -> String {
        self.text
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_open_paren(&self) -> bool {
        self.kind == TokenKind::Open && self.text == "("
    }

    pub fn is_close_paren(&self) -> bool {
        self.kind == TokenKind::Close && self.text == ")"
    }

    pub fn is_comma(&self) -> bool {
        self.kind == TokenKind::Punctuation && self.text == ","
    }

    pub fn is_line_comment(&self) -> bool {
        self.kind == TokenKind::Comment && self.text.starts_with("--")
    }
}

/// Lazy tokenizer over a query string.
///
/// Whitespace tokens are skipped unless the lexer is built with
/// [`Lexer::keep_whitespace`].
#[derive(Debug, Clone)]
pub struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    skip_whitespace: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            skip_whitespace: true,
        }
    }

    pub fn keep_whitespace(mut self) -> Self {
        self.skip_whitespace = false;
        self
    }

    pub fn input(&self) -> &'a str {
        self.input
    }

    /// Unconsumed input
    pub fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Skip `len` bytes of the remaining input without lexing them
    pub fn advance(&mut self, len: usize) {
        self.pos = (self.pos + len).min(self.input.len());
    }

    /// Discard everything that is left
    pub fn finish(&mut self) {
        self.pos = self.input.len();
    }

    /// Lex the next token, or `None` at end of input
    pub fn next_token(&mut self) -> Result<Option<Token<'a>>> {
        loop {
            if self.pos >= self.input.len() {
                return Ok(None);
            }

            let rest = self.remaining();
            let lex_error = || CompileError::Lex {
                remaining: rest.to_string(),
            };

            let pair = TokenGrammar::parse(Rule::token, rest)
                .map_err(|_| lex_error())?
                .next()
                .and_then(|token| token.into_inner().next())
                .ok_or_else(lex_error)?;

            let kind = TokenKind::from_rule(pair.as_rule()).ok_or_else(lex_error)?;
            let text = pair.as_str();
            if text.is_empty() {
                return Err(lex_error());
            }

            let token = Token {
                kind,
                text,
                offset: self.pos,
            };
            self.pos += text.len();

            if kind == TokenKind::Whitespace && self.skip_whitespace {
                continue;
            }
            return Ok(Some(token));
        }
    }

    /// Lex the next token, failing if the input is exhausted
    pub fn expect_next(&mut self, expected: &str) -> Result<Token<'a>> {
        let remaining = self.remaining();
        self.next_token()?.ok_or_else(|| CompileError::Syntax {
            expected: expected.to_string(),
            found: String::new(),
            remaining: remaining.to_string(),
        })
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Result<Token<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_token() {
            Ok(Some(token)) => Some(Ok(token)),
            Ok(None) => None,
            Err(e) => {
                // Stop after the first error
                self.finish();
                Some(Err(e))
            }
        }
    }
}

/// Tokenize a whole string, skipping whitespace
pub fn tokenize(input: &str) -> Result<Vec<Token<'_>>> {
    Lexer::new(input).collect()
}
