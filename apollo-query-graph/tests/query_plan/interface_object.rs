use super::compute_paths;

const API_SCHEMA: &str = r#"
    type Query { i: I }
    interface I { id: ID! extra: Int }
    type A implements I { id: ID! a: Int extra: Int }
"#;

const S1: &str = r#"
    type Query { i: I }
    interface I @key(fields: "id") { id: ID! }
    type A implements I @key(fields: "id") { id: ID! a: Int }
"#;

const S2: &str = r#"
    type Query { s2: Int }
    type I @key(fields: "id") @interfaceObject { id: ID! extra: Int }
"#;

#[test]
fn interface_object_fields_are_collected_from_the_interface_object() {
    let planner = planner!(api = API_SCHEMA, s1: S1, s2: S2);
    let paths = compute_paths(&planner, "{ i { id extra } }", Default::default()).unwrap();
    let branches = paths.branches();
    assert_eq!(branches.len(), 2, "{paths}");
    assert_eq!(branches[0].option_subgraphs().unwrap()[0], ["s1"]);
    let extra_options = branches[1].option_subgraphs().unwrap();
    assert!(!extra_options.is_empty(), "{paths}");
    assert!(
        extra_options
            .iter()
            .all(|option| option.iter().all(|subgraph| subgraph == "s2")),
        "{paths}"
    );
}

#[test]
fn interface_object_nodes_get_a_fake_downcast_per_implementation() {
    let planner = planner!(api = API_SCHEMA, s1: S1, s2: S2);
    let json = planner.query_graph().to_json();
    let downcasts = json["edges"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|edge| {
            edge["label"]
                .as_str()
                .is_some_and(|label| label.starts_with("{ __typename } ⊢"))
        })
        .count();
    assert_eq!(downcasts, 1, "{json:#}");
}
