use apollo_query_graph::QueryPlanOptions;
use apollo_query_graph::error::SingleFederationError;
use pretty_assertions::assert_eq;

use super::branch_subgraphs;
use super::compute_paths;

const API_SCHEMA: &str = r#"
    type Query { t: T }
    type T { id: ID! name: String price: Int weight: Int shippingEstimate: Int }
"#;

const PRODUCTS: &str = r#"
    type Query { t: T }
    type T @key(fields: "id") { id: ID! name: String weight: Int }
"#;

const PRICES: &str = r#"
    type Query { prices: Int }
    type T @key(fields: "id") { id: ID! price: Int }
"#;

const SHIPPING: &str = r#"
    type Query { shipping: Int }
    type T @key(fields: "id") {
        id: ID!
        weight: Int @external
        shippingEstimate: Int @requires(fields: "weight")
    }
"#;

#[test]
fn fields_are_collected_where_they_are_resolved() {
    let planner = planner!(
        api = API_SCHEMA,
        products: PRODUCTS,
        prices: PRICES,
        shipping: SHIPPING,
    );
    let paths = compute_paths(&planner, "{ t { name price } }", Default::default()).unwrap();
    assert_eq!(
        branch_subgraphs(&paths),
        [
            ("t.name".to_owned(), vec![vec!["products".to_owned()]]),
            ("t.price".to_owned(), vec![vec!["prices".to_owned()]]),
        ]
    );
    let jumps: Vec<_> = paths
        .branches()
        .iter()
        .map(|branch| branch.min_subgraph_jumps().unwrap())
        .collect();
    assert_eq!(jumps, [Some(0), Some(1)]);
}

#[test]
fn required_fields_are_fetched_before_the_requiring_field() {
    let planner = planner!(
        api = API_SCHEMA,
        products: PRODUCTS,
        prices: PRICES,
        shipping: SHIPPING,
    );
    let paths = compute_paths(&planner, "{ t { shippingEstimate } }", Default::default()).unwrap();
    let [branch] = paths.branches() else {
        panic!("expected a single branch:\n{paths}");
    };
    assert_eq!(branch.option_subgraphs().unwrap(), [["shipping"]]);
    assert_eq!(branch.min_subgraph_jumps().unwrap(), Some(1));
}

#[test]
fn provided_fields_are_collected_locally() {
    let planner = planner!(
        api = "type Query { t: T } type T { id: ID! name: String }",
        reviews: r#"
            type Query { t: T @provides(fields: "name") }
            type T @key(fields: "id") { id: ID! name: String @external }
        "#,
        products: r#"
            type Query { products: Int }
            type T @key(fields: "id") { id: ID! name: String }
        "#,
    );
    let paths = compute_paths(&planner, "{ t { name } }", QueryPlanOptions::default()).unwrap();
    let [branch] = paths.branches() else {
        panic!("expected a single branch:\n{paths}");
    };
    assert_eq!(branch.option_subgraphs().unwrap(), [["reviews"]]);
    assert_eq!(branch.min_subgraph_jumps().unwrap(), Some(0));
}

#[test]
fn fields_without_any_path_have_no_plan() {
    let planner = planner!(
        api = "type Query { t: T other: Int } type T { id: ID! x: Int }",
        s1: "type Query { t: T } type T { id: ID! }",
        s2: "type Query { other: Int } type T { id: ID! x: Int }",
    );
    let error = compute_paths(&planner, "{ t { x } }", Default::default()).unwrap_err();
    assert!(
        matches!(
            error.errors().as_slice(),
            [SingleFederationError::NoPlanFound { .. }]
        ),
        "{error}"
    );
    assert_eq!(error.errors()[0].code(), "NO_PLAN_FOUND");
}
