use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use chquery::{
    AdHocFilter, CompileError, CompileRequest, Expander, QueryOptions, Source, TimeRange, Variable,
    VariableKind, VariableValue, compile, parse_query, print_ast,
};

fn strings(items: &[&str]) -> Option<Vec<String>> {
    Some(items.iter().map(|s| s.to_string()).collect())
}

fn request() -> CompileRequest {
    let options = QueryOptions {
        database: "db".to_string(),
        table: "tbl".to_string(),
        interval: "30s".to_string(),
        ..QueryOptions::default()
    };
    let range = TimeRange::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap(),
    );
    CompileRequest::new(options, range)
}

#[test]
fn test_clause_tree() {
    let ast = parse_query(
        "SELECT EventDate, col1 FROM t PREWHERE Event IN ('x') WHERE a GLOBAL IN s GROUP BY EventDate",
    )
    .unwrap();
    assert_eq!(ast.select, strings(&["EventDate", "col1"]));
    assert_eq!(ast.from, Some(Source::Table(vec!["t".to_string()])));
    assert_eq!(ast.prewhere, strings(&["Event IN ('x')"]));
    assert_eq!(ast.where_clause, strings(&["a GLOBAL IN s"]));
    assert_eq!(ast.group_by, strings(&["EventDate"]));
}

#[test]
fn test_rate_expansion() {
    let query = "$rate(countIf(Type = 200) AS good, countIf(Type != 200) AS bad) FROM requests";
    let expanded = Expander::new(false).apply(query, &parse_query(query).unwrap()).unwrap();
    assert_eq!(
        expanded,
        "SELECT t, good/runningDifference(t/1000) goodRate, bad/runningDifference(t/1000) badRate \
         FROM (SELECT $timeSeries AS t, countIf(Type = 200) AS good, countIf(Type != 200) AS bad \
         FROM requests WHERE $timeFilter GROUP BY t ORDER BY t)"
    );
}

#[test]
fn test_columns_relocate_trailing_clauses() {
    let query = "$columns(category, sum(v) as value) FROM t WHERE c='x' \
                 GROUP BY t, category HAVING value > 100 ORDER BY t, category";
    let expanded = Expander::new(false).apply(query, &parse_query(query).unwrap()).unwrap();
    assert!(expanded.contains("FROM t WHERE $timeFilter AND c='x'"));
    assert!(expanded.contains("GROUP BY t, category HAVING value > 100 ORDER BY t, category)"));
    assert!(expanded.ends_with(") GROUP BY t ORDER BY t"));
}

#[test]
fn test_ad_hoc_filter_in_innermost_where() {
    let request = request().with_ad_hoc_filters(vec![AdHocFilter::new("db.tbl.col", "=~", "%x%")]);
    let sql = compile(
        "SELECT count() FROM (SELECT * FROM db.tbl WHERE status = 200)",
        &request,
    )
    .unwrap();
    assert_eq!(
        sql,
        "SELECT count()\nFROM (\n    SELECT *\n    FROM db.tbl\n    WHERE\n        status = 200\n        \
         AND col LIKE '%x%'\n)"
    );
}

#[test]
fn test_ad_hoc_filter_after_array_join_list() {
    let request = request().with_ad_hoc_filters(vec![AdHocFilter::new("db.tbl.col", "=", "v")]);
    let sql = compile(
        "SELECT a FROM db.tbl ARRAY JOIN arr1 AS x, arr2 AS y WHERE a = 1",
        &request,
    )
    .unwrap();
    assert_eq!(
        sql,
        "SELECT a\nFROM db.tbl\nARRAY JOIN arr1 AS x, arr2 AS y\nWHERE\n    a = 1\n    AND col = 'v'"
    );
}

#[test]
fn test_conditional_predicate() {
    let query = "SELECT 1 FROM t WHERE x = 1 $conditionalTest(AND col=10, $v)";

    let empty = request().with_variables(vec![
        Variable::new("v", VariableKind::Query, VariableValue::List(Vec::new())).multi(),
    ]);
    assert_eq!(compile(query, &empty).unwrap(), "SELECT 1 FROM t WHERE x = 1 ");

    let selected = request().with_variables(vec![
        Variable::new("v", VariableKind::Query, vec!["a", "b"]).multi(),
    ]);
    assert_eq!(
        compile(query, &selected).unwrap(),
        "SELECT 1 FROM t WHERE x = 1 AND col=10"
    );
}

#[test]
fn test_union_subquery_branches() {
    let query = "$rate(count() AS c) FROM (SELECT ts FROM a UNION ALL SELECT ts FROM b)";
    let ast = parse_query(query).unwrap();
    let Some(Source::Subquery(sub)) = &ast.from else {
        panic!("Expected subquery source, got {:?}", ast.from);
    };
    assert_eq!(sub.from, Some(Source::Table(vec!["a".to_string()])));
    let branches = sub.union_all.as_ref().unwrap();
    assert_eq!(branches.len(), 1);
    assert_eq!(branches[0].from, Some(Source::Table(vec!["b".to_string()])));

    let expanded = Expander::new(false).apply(query, &ast).unwrap();
    assert!(expanded.contains(
        "FROM (SELECT ts FROM a WHERE $timeFilter UNION ALL SELECT ts FROM b WHERE $timeFilter)"
    ));
}

#[test]
fn test_full_pipeline_with_window_functions() {
    let mut request = request();
    request.options.use_window_functions = true;
    request.options.date_column = Some("EventDate".to_string());
    let request = request.with_variables(vec![
        Variable::new("host", VariableKind::Custom, vec!["web-1", "web-2"]).multi(),
    ]);

    let sql = compile(
        "$perSecondColumns(host, bytes) FROM $table WHERE host IN ($host)",
        &request,
    )
    .unwrap();
    assert!(sql.contains("FROM db.tbl WHERE EventDate >= toDate("));
    assert!(sql.contains("AND host IN ('web-1','web-2')"));
    assert!(sql.contains("lagInFrame(max_0, 1, max_0) OVER ()"));
    assert!(!sql.contains('$'));
}

#[test]
fn test_error_kinds() {
    let err = compile("$columns(a) FROM t", &request()).unwrap_err();
    assert!(matches!(err, CompileError::MacroArity { .. }));

    let err = compile("$rate(x AS y)", &request()).unwrap_err();
    assert!(matches!(err, CompileError::FromClauseMissing { .. }));

    let err = compile("$rate(x AS y FROM t", &request()).unwrap_err();
    assert!(matches!(err, CompileError::UnbalancedParen { .. }));
    assert!(!err.to_string().is_empty());
}

#[test]
fn test_printed_query_compiles_like_the_original() {
    let query = "SELECT $timeSeries AS t, count() FROM $table WHERE $timeFilter GROUP BY t ORDER BY t";
    let printed = print_ast(&parse_query(query).unwrap());
    let request = request();
    let a = compile(query, &request).unwrap();
    let b = compile(&printed, &request).unwrap();
    assert_eq!(
        a.split_whitespace().collect::<Vec<_>>(),
        b.split_whitespace().collect::<Vec<_>>()
    );
}

fn identifier() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,6}".prop_filter("not a keyword", |s| {
        !matches!(
            s.as_str(),
            "select" | "from" | "where" | "prewhere" | "having" | "limit" | "format" | "with"
                | "and" | "or" | "in" | "on" | "using" | "join" | "as" | "group" | "order"
                | "union" | "not" | "global" | "any" | "all" | "left" | "right" | "inner"
                | "full" | "cross" | "array" | "asof" | "semi" | "anti" | "paste" | "outer"
        )
    })
}

proptest! {
    #[test]
    fn test_generated_queries_parse_identically(
        columns in prop::collection::vec(identifier(), 1..4),
        table in identifier(),
        predicate in identifier(),
        value in 0u32..1000,
    ) {
        let query = format!(
            "SELECT {} FROM {table} WHERE ({predicate} > {value}) AND {predicate} < {} GROUP BY {}",
            columns.join(", "),
            value + 10,
            columns[0],
        );
        let first = parse_query(&query).unwrap();
        let second = parse_query(&query).unwrap();
        prop_assert_eq!(&first, &second);

        for item in first.where_clause.iter().flatten() {
            prop_assert_eq!(item.matches('(').count(), item.matches(')').count());
        }
        prop_assert_eq!(parse_query(&print_ast(&first)).unwrap(), first);
    }
}
