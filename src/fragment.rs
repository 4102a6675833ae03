//! Lexer-backed text helpers
//!
//! Everything here works on token boundaries and parenthesis depth, so
//! keywords, commas and parentheses inside string literals, comments or
//! subqueries are never mistaken for structure.

use crate::error::{CompileError, Result};
use crate::lexer::{Lexer, Token, TokenKind};

/// Text up to the `)` matching an already-consumed `(`.
///
/// `input` starts right after the opening parenthesis. The returned slice
/// excludes the closing parenthesis.
pub fn between_braces(input: &str) -> Result<&str> {
    let mut depth = 1usize;
    for token in Lexer::new(input) {
        let token = token?;
        if token.is_open_paren() {
            depth += 1;
        } else if token.is_close_paren() {
            depth -= 1;
            if depth == 0 {
                return Ok(&input[..token.offset]);
            }
        }
    }
    Err(CompileError::UnbalancedParen {
        span: input.to_string(),
    })
}

/// Tokens at parenthesis depth zero, whitespace skipped.
///
/// Parentheses themselves are reported at the depth outside of them.
pub fn top_level_tokens(input: &str) -> Result<Vec<Token<'_>>> {
    let mut depth = 0usize;
    let mut tokens = Vec::new();
    for token in Lexer::new(input) {
        let token = token?;
        if token.is_close_paren() {
            depth = depth.saturating_sub(1);
        }
        if depth == 0 {
            tokens.push(token);
        }
        if token.is_open_paren() {
            depth += 1;
        }
    }
    Ok(tokens)
}

/// First top-level clause keyword among `keywords` (normalized form, e.g. `group by`)
pub fn find_keyword<'a>(input: &'a str, keywords: &[&str]) -> Result<Option<Token<'a>>> {
    Ok(top_level_tokens(input)?.into_iter().find(|token| {
        token.kind == TokenKind::Statement && keywords.contains(&token.keyword().as_str())
    }))
}

/// Split on top-level tokens matching `is_separator`; separators are dropped
pub fn split_top_level<'a>(
    input: &'a str,
    is_separator: impl Fn(&Token<'a>) -> bool,
) -> Result<Vec<&'a str>> {
    let mut parts = Vec::new();
    let mut start = 0;
    for token in top_level_tokens(input)? {
        if is_separator(&token) {
            parts.push(&input[start..token.offset]);
            start = token.end();
        }
    }
    parts.push(&input[start..]);
    Ok(parts)
}

/// Split a macro argument list on top-level commas, trimming each argument
pub fn split_arguments(input: &str) -> Result<Vec<String>> {
    if input.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(split_top_level(input, Token::is_comma)?
        .into_iter()
        .map(|arg| arg.trim().to_string())
        .collect())
}

/// Split a statement on top-level `UNION ALL`
pub fn split_union_all(input: &str) -> Result<Vec<&str>> {
    split_top_level(input, |token| {
        token.kind == TokenKind::Statement && token.keyword() == "union all"
    })
}

/// Locate a `$name(...)` call at any depth.
///
/// Returns the byte range of the whole call and the argument text.
pub fn find_call<'a>(input: &'a str, name: &str) -> Result<Option<(usize, usize, &'a str)>> {
    let mut lexer = Lexer::new(input);
    while let Some(token) = lexer.next_token()? {
        if token.kind != TokenKind::MacroVariable || token.text != name {
            continue;
        }
        let open = lexer.expect_next("(")?;
        if !open.is_open_paren() {
            return Err(CompileError::Syntax {
                expected: format!("( after {name}"),
                found: open.text.to_string(),
                remaining: input[open.offset..].to_string(),
            });
        }
        let args = between_braces(lexer.remaining())?;
        let end = open.end() + args.len() + 1;
        return Ok(Some((token.offset, end, args)));
    }
    Ok(None)
}

/// Whether the last token of `text` is a `--` comment, so anything appended
/// on the same line would be commented out
pub fn ends_with_line_comment(text: &str) -> bool {
    Lexer::new(text)
        .filter_map(|token| token.ok())
        .last()
        .is_some_and(|token| token.is_line_comment())
}

/// Drop every comment token, keeping all other text as is
pub fn strip_comments(input: &str) -> Result<String> {
    let mut output = String::with_capacity(input.len());
    for token in Lexer::new(input).keep_whitespace() {
        let token = token?;
        if token.kind != TokenKind::Comment {
            output.push_str(token.text);
        }
    }
    Ok(output)
}

/// Split `expr AS alias` at a top-level AS, or `call(...) alias` where the
/// alias follows a closing parenthesis without AS.
///
/// Returns the expression and the alias, or `None` when there is no alias.
pub fn split_alias(input: &str) -> Result<Option<(String, String)>> {
    let tokens = top_level_tokens(input)?;
    let [.., before, alias] = tokens.as_slice() else {
        return Ok(None);
    };
    if !matches!(alias.kind, TokenKind::Identifier | TokenKind::String) {
        return Ok(None);
    }

    let expr_end = if before.kind == TokenKind::Identifier && before.text.eq_ignore_ascii_case("as") {
        if tokens.len() < 3 {
            return Ok(None);
        }
        before.offset
    } else if before.is_close_paren() {
        alias.offset
    } else {
        return Ok(None);
    };
    let expr = input[..expr_end].trim().to_string();
    Ok(Some((expr, alias.text.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_between_braces() {
        assert_eq!(between_braces("a, (b)) FROM t").unwrap(), "a, (b)");
        assert_eq!(between_braces(") rest").unwrap(), "");
    }

    #[test]
    fn test_between_braces_ignores_quoted_parens() {
        assert_eq!(between_braces("x = ')' ) tail").unwrap(), "x = ')' ");
    }

    #[test]
    fn test_between_braces_unbalanced() {
        let err = between_braces("a, (b) FROM t").unwrap_err();
        assert!(matches!(err, CompileError::UnbalancedParen { .. }));
    }

    #[test]
    fn test_find_keyword_skips_subqueries() {
        let query = "FROM (SELECT a FROM b WHERE c) WHERE d";
        let token = find_keyword(query, &["where"]).unwrap().unwrap();
        assert_eq!(&query[token.end()..], " d");
    }

    #[test]
    fn test_split_arguments() {
        let args = split_arguments("a, f(b, c) AS x, 'd,e'").unwrap();
        assert_eq!(args, vec!["a", "f(b, c) AS x", "'d,e'"]);
        assert!(split_arguments("  ").unwrap().is_empty());
    }

    #[test]
    fn test_split_union_all() {
        let parts = split_union_all("SELECT 1 UNION ALL SELECT (2 UNION ALL 3) union all SELECT 4").unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].trim(), "SELECT (2 UNION ALL 3)");
    }

    #[test]
    fn test_find_call() {
        let query = "WHERE $unescape('a(b)') AND x";
        let (start, end, args) = find_call(query, "$unescape").unwrap().unwrap();
        assert_eq!(&query[start..end], "$unescape('a(b)')");
        assert_eq!(args, "'a(b)'");
        assert!(find_call(query, "$conditionalTest").unwrap().is_none());
    }

    #[test]
    fn test_ends_with_line_comment() {
        assert!(ends_with_line_comment("a -- note"));
        assert!(!ends_with_line_comment("a /* note */"));
        assert!(!ends_with_line_comment("'-- not a comment'"));
    }

    #[test]
    fn test_strip_comments() {
        let stripped = strip_comments("SELECT 1 -- one\n/* two */FROM t WHERE s = '--x'").unwrap();
        assert_eq!(stripped, "SELECT 1 \nFROM t WHERE s = '--x'");
    }

    #[test]
    fn test_split_alias() {
        assert_eq!(
            split_alias("sum(v) as value").unwrap(),
            Some(("sum(v)".to_string(), "value".to_string()))
        );
        assert_eq!(split_alias("sum(v)").unwrap(), None);
        assert_eq!(split_alias("host").unwrap(), None);
        assert_eq!(split_alias("AS x").unwrap(), None);
    }

    #[test]
    fn test_split_implicit_alias() {
        assert_eq!(
            split_alias("sum(v) total").unwrap(),
            Some(("sum(v)".to_string(), "total".to_string()))
        );
        assert_eq!(
            split_alias("if(a > 0, a, 0) `pos`").unwrap(),
            Some(("if(a > 0, a, 0)".to_string(), "`pos`".to_string()))
        );
        // Only a closing parenthesis introduces an implicit alias
        assert_eq!(split_alias("DISTINCT host").unwrap(), None);
        assert_eq!(split_alias("a + b").unwrap(), None);
    }
}
