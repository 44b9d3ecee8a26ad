use apollo_compiler::ExecutableDocument;
use apollo_query_graph::QueryPlanOptions;
use apollo_query_graph::QueryPlanner;
use apollo_query_graph::QueryPlannerConfig;
use apollo_query_graph::error::SingleFederationError;
use apollo_query_graph::query_plan::query_planner::QueryPlannerDebugConfig;
use pretty_assertions::assert_eq;

use super::compute_paths;

const SUBGRAPH_COUNT: usize = 10;

/// Ten subgraphs that can all resolve `T.x` and jump to each other through the same key.
fn wide_planner() -> QueryPlanner {
    let subgraphs: Vec<_> = (0..SUBGRAPH_COUNT)
        .map(|index| {
            let query_field = if index == 0 { "t: T" } else { "unused: Int" };
            (
                format!("s{index}"),
                format!(
                    r#"type Query {{ {query_field} }} type T @key(fields: "id") {{ id: ID! x: Int }}"#
                ),
            )
        })
        .collect();
    let subgraphs: Vec<_> = subgraphs
        .iter()
        .map(|(name, sdl)| (name.as_str(), sdl.as_str()))
        .collect();
    super::planner(
        "type Query { t: T unused: Int } type T { id: ID! x: Int }",
        QueryPlannerConfig::default(),
        &subgraphs,
    )
}

fn aliased_selections(count: usize) -> String {
    (0..count)
        .map(|index| format!("x{index}: x"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[test]
fn too_many_non_local_selections_abort_planning() {
    let planner = wide_planner();
    let operation = format!("query Wide {{ t {{ {} }} }}", aliased_selections(12_000));
    let document = ExecutableDocument::parse_and_validate(
        planner.api_schema().schema(),
        &operation,
        "operation.graphql",
    )
    .unwrap();
    let error = planner
        .compute_operation_paths(&document, None, QueryPlanOptions::default())
        .unwrap_err();
    let errors = error.errors();
    let [SingleFederationError::QueryPlanComplexityExceeded { message }] = errors.as_slice() else {
        panic!("unexpected error: {error}");
    };
    assert!(
        message.starts_with("Query planning was aborted because the number of non-local selections"),
        "{message}"
    );
    assert!(
        message.ends_with("exceeds the limit of 100000 for operation \"Wide\""),
        "{message}"
    );
}

#[test]
fn small_operations_stay_under_the_non_local_selections_limit() {
    let planner = wide_planner();
    let operation = format!("{{ t {{ {} }} }}", aliased_selections(3));
    let paths = compute_paths(&planner, &operation, Default::default()).unwrap();
    assert_eq!(paths.branches().len(), 3);
    // Every candidate T node is counted for each selection under `t`.
    assert!(paths.statistics().non_local_selections_estimate >= 3 * SUBGRAPH_COUNT as u64);
}

#[test]
fn paths_limit_bounds_the_options_of_a_selection() {
    let planner = planner!(
        api = "type Query { t: T } type T { id: ID! x: Int }",
        config = QueryPlannerConfig {
            debug: QueryPlannerDebugConfig {
                paths_limit: Some(0),
                ..Default::default()
            },
        },
        s1: r#"type Query { t: T } type T @key(fields: "id") { id: ID! }"#,
        s2: r#"type Query { s2: Int } type T @key(fields: "id") { id: ID! x: Int }"#,
    );
    let error = compute_paths(&planner, "{ t { x } }", Default::default()).unwrap_err();
    assert_eq!(error.errors()[0].code(), "PATHS_LIMIT_EXCEEDED");
}
