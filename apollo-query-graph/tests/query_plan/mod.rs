use apollo_compiler::ExecutableDocument;
use apollo_query_graph::QueryPlanOptions;
use apollo_query_graph::QueryPlanner;
use apollo_query_graph::QueryPlannerConfig;
use apollo_query_graph::Subgraph;
use apollo_query_graph::Supergraph;
use apollo_query_graph::error::FederationError;
use apollo_query_graph::query_plan::query_planner::OperationPaths;

/// Builds a query planner over the given API schema and `name: sdl` subgraphs.
macro_rules! planner {
    (
        api = $api_schema: expr,
        config = $config: expr,
        $( $subgraph_name: ident: $subgraph_schema: expr),+
        $(,)?
    ) => {
        $crate::query_plan::planner(
            $api_schema,
            $config,
            &[ $( (stringify!($subgraph_name), $subgraph_schema) ),+ ],
        )
    };
    (
        api = $api_schema: expr,
        $( $subgraph_name: ident: $subgraph_schema: expr),+
        $(,)?
    ) => {
        planner!(
            api = $api_schema,
            config = Default::default(),
            $( $subgraph_name: $subgraph_schema),+
        )
    };
}

mod entities;
mod interface_object;
mod limits;
mod overrides;

fn planner(
    api_schema: &str,
    config: QueryPlannerConfig,
    subgraphs: &[(&str, &str)],
) -> QueryPlanner {
    let supergraph = Supergraph::new(
        api_schema,
        subgraphs
            .iter()
            .map(|(name, sdl)| Subgraph::new(name, &format!("http://{name}"), sdl)),
    )
    .unwrap();
    QueryPlanner::new(&supergraph, config).unwrap()
}

fn compute_paths(
    planner: &QueryPlanner,
    operation: &str,
    options: QueryPlanOptions,
) -> Result<OperationPaths, FederationError> {
    let document = ExecutableDocument::parse_and_validate(
        planner.api_schema().schema(),
        operation,
        "operation.graphql",
    )
    .unwrap();
    planner.compute_operation_paths(&document, None, options)
}

/// The subgraphs reached by each option of each branch, keyed by response path.
fn branch_subgraphs(paths: &OperationPaths) -> Vec<(String, Vec<Vec<String>>)> {
    paths
        .branches()
        .iter()
        .map(|branch| {
            (
                branch.response_path().join("."),
                branch.option_subgraphs().unwrap(),
            )
        })
        .collect()
}
