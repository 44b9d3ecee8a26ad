use apollo_query_graph::QueryPlanOptions;
use pretty_assertions::assert_eq;
use rstest::rstest;

use super::compute_paths;

const API_SCHEMA: &str = "type Query { t: T } type T { id: ID! x: Int }";

const S1: &str = r#"
    type Query { t: T }
    type T @key(fields: "id") { id: ID! x: Int }
"#;

#[rstest]
#[case::no_label(&[], "s1", Some(0))]
#[case::unrelated_label(&["other"], "s1", Some(0))]
#[case::enabled_label(&["percent(50)"], "s2", Some(1))]
fn progressive_override_follows_the_enabled_labels(
    #[case] labels: &[&str],
    #[case] subgraph: &str,
    #[case] jumps: Option<u32>,
) {
    let planner = planner!(
        api = API_SCHEMA,
        s1: S1,
        s2: r#"
            type Query { s2: Int }
            type T @key(fields: "id") { id: ID! x: Int @override(from: "s1", label: "percent(50)") }
        "#,
    );
    let options = QueryPlanOptions {
        override_conditions: labels.iter().map(|label| label.to_string()).collect(),
    };
    let paths = compute_paths(&planner, "{ t { x } }", options).unwrap();
    let [branch] = paths.branches() else {
        panic!("expected a single branch:\n{paths}");
    };
    assert_eq!(branch.option_subgraphs().unwrap(), [[subgraph]]);
    assert_eq!(branch.min_subgraph_jumps().unwrap(), jumps);
}

#[test]
fn overridden_fields_are_only_collected_from_the_overriding_subgraph() {
    let planner = planner!(
        api = API_SCHEMA,
        s1: S1,
        s2: r#"
            type Query { s2: Int }
            type T @key(fields: "id") { id: ID! x: Int @override(from: "s1") }
        "#,
    );
    let paths = compute_paths(&planner, "{ t { x } }", QueryPlanOptions::default()).unwrap();
    assert_eq!(paths.branches()[0].option_subgraphs().unwrap(), [["s2"]]);
}
