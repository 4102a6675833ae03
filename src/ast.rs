use std::collections::BTreeMap;
use std::fmt;

/// Clause a fragment is pushed into
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Clause {
    /// Leading comments and anything before the first clause keyword
    Root,
    With,
    Select,
    From,
    /// Alias and modifiers following a `FROM (subquery)`
    Aliases,
    Prewhere,
    Where,
    GroupBy,
    Having,
    OrderBy,
    Limit,
    Format,
    UnionAll,
    /// Aggregation macro, keyed by its name (e.g. `$rate`)
    Macro(String),
}

impl Clause {
    /// Map a normalized clause keyword (see `Token::keyword`) to its clause
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        let clause = match keyword {
            "with" => Clause::With,
            "select" => Clause::Select,
            "from" => Clause::From,
            "prewhere" => Clause::Prewhere,
            "where" => Clause::Where,
            "group by" => Clause::GroupBy,
            "having" => Clause::Having,
            "order by" => Clause::OrderBy,
            "limit" => Clause::Limit,
            "format" => Clause::Format,
            "union all" => Clause::UnionAll,
            _ => return None,
        };
        Some(clause)
    }

    pub fn name(&self) -> &str {
        match self {
            Clause::Root => "root",
            Clause::With => "with",
            Clause::Select => "select",
            Clause::From => "from",
            Clause::Aliases => "aliases",
            Clause::Prewhere => "prewhere",
            Clause::Where => "where",
            Clause::GroupBy => "group by",
            Clause::Having => "having",
            Clause::OrderBy => "order by",
            Clause::Limit => "limit",
            Clause::Format => "format",
            Clause::UnionAll => "union all",
            Clause::Macro(name) => name,
        }
    }

    /// Clauses whose items are predicates carrying their own AND / OR
    pub fn is_predicate(&self) -> bool {
        matches!(self, Clause::Where | Clause::Prewhere)
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Data source of a FROM clause or a join
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// Table references, table functions and their modifiers, as fragments
    Table(Vec<String>),
    /// Parenthesized subquery
    Subquery(Box<Ast>),
}

impl Default for Source {
    fn default() -> Self {
        Source::Table(Vec::new())
    }
}

/// Arguments of an aggregation macro
#[derive(Debug, Clone, PartialEq)]
pub enum MacroArgs {
    /// Comma separated argument expressions
    List(Vec<String>),
    /// Arguments that parsed as a full statement
    Tree(Box<Ast>),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Join {
    /// Normalized join phrase, e.g. `any left join`
    pub kind: String,
    pub source: Source,
    pub aliases: Vec<String>,
    pub using: Vec<String>,
    /// ON predicates; every item after the first starts with AND / OR
    pub on: Vec<String>,
}

impl Join {
    pub fn new(kind: String) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }
}

/// Clause tree of one query nesting level.
///
/// A clause that never appeared is `None`; an empty list means the keyword
/// appeared without items (or, for `select`, that a macro stands in for it).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Ast {
    pub root: Vec<String>,
    pub macros: BTreeMap<String, MacroArgs>,
    pub with: Option<Vec<String>>,
    pub select: Option<Vec<String>>,
    pub from: Option<Source>,
    pub aliases: Option<Vec<String>>,
    pub joins: Vec<Join>,
    pub prewhere: Option<Vec<String>>,
    pub where_clause: Option<Vec<String>>,
    pub group_by: Option<Vec<String>>,
    pub having: Option<Vec<String>>,
    pub order_by: Option<Vec<String>>,
    pub limit: Option<Vec<String>>,
    pub format: Option<Vec<String>>,
    pub union_all: Option<Vec<Ast>>,
}

impl Ast {
    /// Whether the clause was already opened at this level
    pub fn has(&self, clause: &Clause) -> bool {
        match clause {
            Clause::Root => true,
            Clause::From => self.from.is_some(),
            Clause::UnionAll => self.union_all.is_some(),
            Clause::Macro(name) => self.macros.contains_key(name),
            other => self.fragment_slot(other).is_some_and(|slot| slot.is_some()),
        }
    }

    /// Open an empty clause
    pub fn open(&mut self, clause: &Clause) {
        match clause {
            Clause::Root => {}
            Clause::From => {
                self.from.get_or_insert_with(Source::default);
            }
            Clause::UnionAll => {
                self.union_all.get_or_insert_with(Vec::new);
            }
            Clause::Macro(name) => {
                self.macros
                    .entry(name.clone())
                    .or_insert_with(|| MacroArgs::List(Vec::new()));
            }
            other => {
                if let Some(slot) = self.fragment_slot_mut(other) {
                    slot.get_or_insert_with(Vec::new);
                }
            }
        }
    }

    /// Fragment list of a clause, opening it if needed.
    ///
    /// Returns `None` for clauses that do not hold fragments (`union all`, a
    /// macro with tree arguments).
    pub fn items_mut(&mut self, clause: &Clause) -> Option<&mut Vec<String>> {
        match clause {
            Clause::Root => Some(&mut self.root),
            Clause::From => match self.from.get_or_insert_with(Source::default) {
                Source::Table(items) => Some(items),
                // Anything after a FROM subquery belongs to its aliases
                Source::Subquery(_) => Some(self.aliases.get_or_insert_with(Vec::new)),
            },
            Clause::UnionAll => None,
            Clause::Macro(name) => match self
                .macros
                .entry(name.clone())
                .or_insert_with(|| MacroArgs::List(Vec::new()))
            {
                MacroArgs::List(items) => Some(items),
                MacroArgs::Tree(_) => None,
            },
            other => self
                .fragment_slot_mut(other)
                .map(|slot| slot.get_or_insert_with(Vec::new)),
        }
    }

    /// Fragment list of a clause, if present
    pub fn items(&self, clause: &Clause) -> Option<&[String]> {
        match clause {
            Clause::Root => Some(&self.root),
            Clause::From => match self.from.as_ref()? {
                Source::Table(items) => Some(items),
                Source::Subquery(_) => None,
            },
            Clause::UnionAll => None,
            Clause::Macro(name) => match self.macros.get(name)? {
                MacroArgs::List(items) => Some(items),
                MacroArgs::Tree(_) => None,
            },
            other => self.fragment_slot(other)?.as_deref(),
        }
    }

    /// True when nothing but `root` was filled, i.e. the text was a plain list
    pub fn is_bare_root(&self) -> bool {
        let bare = Ast {
            root: self.root.clone(),
            ..Ast::default()
        };
        *self == bare
    }

    /// Follow nested FROM subqueries down to the innermost level
    pub fn innermost_mut(&mut self) -> &mut Ast {
        match self.from {
            Some(Source::Subquery(ref mut sub)) => sub.innermost_mut(),
            _ => self,
        }
    }

    fn fragment_slot(&self, clause: &Clause) -> Option<&Option<Vec<String>>> {
        let slot = match clause {
            Clause::With => &self.with,
            Clause::Select => &self.select,
            Clause::Aliases => &self.aliases,
            Clause::Prewhere => &self.prewhere,
            Clause::Where => &self.where_clause,
            Clause::GroupBy => &self.group_by,
            Clause::Having => &self.having,
            Clause::OrderBy => &self.order_by,
            Clause::Limit => &self.limit,
            Clause::Format => &self.format,
            _ => return None,
        };
        Some(slot)
    }

    fn fragment_slot_mut(&mut self, clause: &Clause) -> Option<&mut Option<Vec<String>>> {
        let slot = match clause {
            Clause::With => &mut self.with,
            Clause::Select => &mut self.select,
            Clause::Aliases => &mut self.aliases,
            Clause::Prewhere => &mut self.prewhere,
            Clause::Where => &mut self.where_clause,
            Clause::GroupBy => &mut self.group_by,
            Clause::Having => &mut self.having,
            Clause::OrderBy => &mut self.order_by,
            Clause::Limit => &mut self.limit,
            Clause::Format => &mut self.format,
            _ => return None,
        };
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_has() {
        let mut ast = Ast::default();
        assert!(!ast.has(&Clause::Where));
        ast.open(&Clause::Where);
        assert!(ast.has(&Clause::Where));
        assert_eq!(ast.items(&Clause::Where), Some(&[][..]));
    }

    #[test]
    fn test_items_after_subquery_go_to_aliases() {
        let mut ast = Ast {
            from: Some(Source::Subquery(Box::default())),
            ..Ast::default()
        };
        ast.items_mut(&Clause::From).unwrap().push("AS t".to_string());
        assert_eq!(ast.aliases, Some(vec!["AS t".to_string()]));
    }

    #[test]
    fn test_bare_root() {
        let mut ast = Ast::default();
        ast.root.push("a".to_string());
        assert!(ast.is_bare_root());
        ast.open(&Clause::Select);
        assert!(!ast.is_bare_root());
    }

    #[test]
    fn test_innermost() {
        let inner = Ast {
            from: Some(Source::Table(vec!["t".to_string()])),
            ..Ast::default()
        };
        let mut outer = Ast {
            from: Some(Source::Subquery(Box::new(inner))),
            ..Ast::default()
        };
        let innermost = outer.innermost_mut();
        assert_eq!(innermost.from, Some(Source::Table(vec!["t".to_string()])));
    }

    #[test]
    fn test_clause_keywords() {
        assert_eq!(Clause::from_keyword("group by"), Some(Clause::GroupBy));
        assert_eq!(Clause::from_keyword("join"), None);
        assert_eq!(Clause::OrderBy.to_string(), "order by");
    }
}
