use std::collections::BTreeSet;
use std::fmt::Display;
use std::fmt::Formatter;
use std::ops::Deref;
use std::sync::Arc;

use apollo_compiler::ExecutableDocument;
use apollo_compiler::Name;
use apollo_compiler::collections::IndexMap;
use apollo_compiler::validation::Valid;
use itertools::Itertools;
use petgraph::graph::NodeIndex;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::error::FederationError;
use crate::error::SingleFederationError;
use crate::operation::Operation;
use crate::query_graph::QueryGraph;
use crate::query_graph::build_federated_query_graph;
use crate::query_graph::condition_resolver::ConditionResolverCache;
use crate::query_graph::graph_path::operation::IndirectPathsCache;
use crate::query_graph::graph_path::operation::SimultaneousPaths;
use crate::query_graph::non_local_selections_estimation::MAX_NON_LOCAL_SELECTIONS;
use crate::query_graph::non_local_selections_estimation::NonLocalSelectionsState;
use crate::query_graph::path_tree::OpPathTree;
use crate::query_plan::query_planning_traversal::QueryPlanningParameters;
use crate::query_plan::query_planning_traversal::QueryPlanningTraversal;
use crate::schema::ValidFederationSchema;
use crate::schema::position::SchemaRootDefinitionKind;
use crate::supergraph::Supergraph;
use crate::utils::logging::snapshot;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryPlannerConfig {
    /// Knobs for debugging and tests. They may change or go away in any release.
    pub debug: QueryPlannerDebugConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryPlannerDebugConfig {
    /// Upper bound on the options kept for a single selection. A field resolvable in several
    /// subgraphs, or an abstract type split into its object types, multiplies options, and a
    /// selection exceeding the bound fails planning with `PATHS_LIMIT_EXCEEDED`.
    ///
    /// Unbounded when `None`, the default.
    pub paths_limit: Option<u32>,

    /// Before any path is computed, the number of selections that may have to be collected outside
    /// of their parent's subgraph is estimated, and planning is aborted when that estimate is
    /// above a fixed ceiling. Setting this disables the estimation entirely.
    ///
    /// Defaults to false.
    pub disable_non_local_selections_check: bool,
}

#[derive(Debug, Clone, Default)]
pub struct QueryPlanOptions {
    /**
     * A set of labels which will be used _during query planning_ to
     * enable/disable edges with a matching label in their override condition.
     * Edges with override conditions require their label to be present or absent
     * from this set in order to be traversable. These labels enable the
     * progressive @override feature.
     */
    pub override_conditions: Vec<String>,
}

/// The progressive `@override` labels enabled for one planning request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub(crate) struct EnabledOverrideConditions(Arc<BTreeSet<String>>);

impl Deref for EnabledOverrideConditions {
    type Target = BTreeSet<String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromIterator<String> for EnabledOverrideConditions {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct QueryPlanningStatistics {
    /// How many (option, selection) pairs the traversal tried to advance.
    pub explored_option_count: usize,
    pub closed_branch_count: usize,
    /// The non-local selections estimate of the operation, or 0 when the check is disabled.
    pub non_local_selections_estimate: u64,
}

pub struct QueryPlanner {
    config: QueryPlannerConfig,
    federated_query_graph: Arc<QueryGraph>,
    api_schema: ValidFederationSchema,
    /// Shared by every request, as condition resolutions only depend on the graph and the
    /// enabled override labels.
    condition_resolver_cache: ConditionResolverCache,
    indirect_paths_cache: IndirectPathsCache,
}

impl QueryPlanner {
    #[cfg_attr(
        feature = "snapshot_tracing",
        tracing::instrument(level = "trace", skip_all, name = "QueryPlanner::new")
    )]
    pub fn new(
        supergraph: &Supergraph,
        config: QueryPlannerConfig,
    ) -> Result<Self, FederationError> {
        let query_graph = build_federated_query_graph(supergraph)?;
        debug!(
            "Built federated query graph with {} nodes and {} edges",
            query_graph.node_count(),
            query_graph.edge_count()
        );
        Ok(Self {
            config,
            federated_query_graph: Arc::new(query_graph),
            api_schema: supergraph.api_schema().clone(),
            condition_resolver_cache: Default::default(),
            indirect_paths_cache: Default::default(),
        })
    }

    pub fn api_schema(&self) -> &ValidFederationSchema {
        &self.api_schema
    }

    pub fn query_graph(&self) -> &QueryGraph {
        &self.federated_query_graph
    }

    pub fn config(&self) -> &QueryPlannerConfig {
        &self.config
    }

    /// Computes, for every leaf selection of the operation, all the ways of collecting it from
    /// the subgraphs.
    #[cfg_attr(
        feature = "snapshot_tracing",
        tracing::instrument(level = "trace", skip_all, name = "QueryPlanner::compute_operation_paths")
    )]
    pub fn compute_operation_paths(
        &self,
        document: &Valid<ExecutableDocument>,
        operation_name: Option<&str>,
        options: QueryPlanOptions,
    ) -> Result<OperationPaths, FederationError> {
        let operation =
            Operation::from_operation_document(self.api_schema.clone(), document, operation_name)?;
        let override_conditions: EnabledOverrideConditions =
            options.override_conditions.into_iter().collect();
        let mut statistics = QueryPlanningStatistics::default();

        if !self.config.debug.disable_non_local_selections_check {
            statistics.non_local_selections_estimate = self.check_non_local_selections(&operation)?;
        }

        let root_kinds_to_nodes = self.federated_query_graph.root_kinds_to_nodes()?;
        let Some(root) = root_kinds_to_nodes.get(&operation.root_kind).copied() else {
            return Err(SingleFederationError::NoPlanFound {
                message: format!("No subgraph defines a {} root type", operation.root_kind),
            }
            .into());
        };

        let parameters = QueryPlanningParameters {
            supergraph_schema: self.federated_query_graph.supergraph_schema()?,
            federated_query_graph: self.federated_query_graph.clone(),
            head: root,
            config: &self.config,
            override_conditions: &override_conditions,
            condition_resolver_cache: &self.condition_resolver_cache,
            indirect_paths_cache: &self.indirect_paths_cache,
        };
        let branches =
            QueryPlanningTraversal::new(parameters, &operation.selection_set, &mut statistics)?
                .find_closed_branches()?;
        statistics.closed_branch_count = branches.len();
        snapshot!(statistics, "operation paths computed");

        Ok(OperationPaths {
            root_kind: operation.root_kind,
            name: operation.name,
            graph: self.federated_query_graph.clone(),
            root,
            branches,
            statistics,
        })
    }

    fn check_non_local_selections(&self, operation: &Operation) -> Result<u64, FederationError> {
        let graph = &self.federated_query_graph;
        let metadata = graph.non_local_selection_metadata();
        let mut state = NonLocalSelectionsState::default();
        let exceeded = metadata.check_non_local_selections_limit_exceeded(
            graph,
            &operation.selection_set,
            &metadata.root_nodes(operation.root_kind),
            &mut state,
            MAX_NON_LOCAL_SELECTIONS,
        )?;
        if exceeded {
            let operation_name = match &operation.name {
                Some(name) => format!("operation \"{name}\""),
                None => "anonymous operation".to_owned(),
            };
            return Err(SingleFederationError::QueryPlanComplexityExceeded {
                message: format!(
                    "Query planning was aborted because the number of non-local selections ({}) exceeds the limit of {MAX_NON_LOCAL_SELECTIONS} for {operation_name}",
                    state.count
                ),
            }
            .into());
        }
        debug!("Estimated {} non-local selections", state.count);
        Ok(state.count)
    }
}

/// A leaf selection of an operation, along with every option of collecting it.
///
/// Each option is a set of simultaneous paths from the federated root that, taken together,
/// collect the selection.
#[derive(Debug, Clone)]
pub struct ClosedBranch {
    pub(crate) response_path: Vec<String>,
    pub(crate) options: Vec<SimultaneousPaths>,
}

impl ClosedBranch {
    /// The response names (and type conditions) leading to the selection.
    pub fn response_path(&self) -> &[String] {
        &self.response_path
    }

    pub fn option_count(&self) -> usize {
        self.options.len()
    }

    /// The subgraphs the paths of each option end in.
    pub fn option_subgraphs(&self) -> Result<Vec<Vec<String>>, FederationError> {
        self.options
            .iter()
            .map(|option| {
                option
                    .0
                    .iter()
                    .map(|path| {
                        Ok(path.graph().node_weight(path.tail())?.source.to_string())
                    })
                    .collect()
            })
            .collect()
    }

    /// The number of subgraph jumps of the cheapest option.
    pub fn min_subgraph_jumps(&self) -> Result<Option<u32>, FederationError> {
        self.options
            .iter()
            .map(|option| {
                option
                    .0
                    .iter()
                    .map(|path| path.subgraph_jumps())
                    .process_results(|jumps| jumps.sum::<u32>())
            })
            .process_results(|jumps| jumps.min())
    }
}

impl Display for ClosedBranch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.response_path.join("."))?;
        for option in &self.options {
            write!(f, "\n  {option}")?;
        }
        Ok(())
    }
}

/// The result of path computation for an operation.
#[derive(Debug)]
pub struct OperationPaths {
    pub(crate) root_kind: SchemaRootDefinitionKind,
    pub(crate) name: Option<Name>,
    graph: Arc<QueryGraph>,
    root: NodeIndex,
    branches: Vec<ClosedBranch>,
    statistics: QueryPlanningStatistics,
}

impl OperationPaths {
    pub fn operation_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_mutation(&self) -> bool {
        self.root_kind == SchemaRootDefinitionKind::Mutation
    }

    pub fn branches(&self) -> &[ClosedBranch] {
        &self.branches
    }

    pub fn statistics(&self) -> &QueryPlanningStatistics {
        &self.statistics
    }

    /// Merges the first option of every branch into a single tree rooted at the federated root.
    ///
    /// Top-level mutation fields must be executed serially, so for mutations the branches of each
    /// top-level field are merged together, but the trees of distinct top-level fields are
    /// concatenated in operation order.
    pub(crate) fn to_path_tree(&self) -> Result<Arc<OpPathTree>, FederationError> {
        let mut trees_by_top_level_field: IndexMap<&str, Arc<OpPathTree>> = IndexMap::default();
        for branch in &self.branches {
            let Some(option) = branch.options.first() else {
                continue;
            };
            let tree = Arc::new(OpPathTree::from_op_paths(
                self.graph.clone(),
                self.root,
                option.0.iter().map(Arc::as_ref),
            )?);
            let top_level_field = branch.response_path.first().map_or("", String::as_str);
            let merged = match trees_by_top_level_field.get(top_level_field) {
                Some(existing) => existing.merge(&tree)?,
                None => tree,
            };
            trees_by_top_level_field.insert(top_level_field, merged);
        }

        let mut result = Arc::new(OpPathTree::leaf(self.graph.clone(), self.root));
        for tree in trees_by_top_level_field.values() {
            result = if self.is_mutation() {
                result.concat(tree)?
            } else {
                result.merge(tree)?
            };
        }
        Ok(result)
    }

    /// Renders the tree of [`OperationPaths::to_path_tree`].
    pub fn path_tree_to_string(&self) -> Result<String, FederationError> {
        Ok(self.to_path_tree()?.to_string())
    }
}

impl Display for OperationPaths {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.root_kind)?;
        if let Some(name) = &self.name {
            write!(f, " {name}")?;
        }
        for branch in &self.branches {
            write!(f, "\n{branch}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::subgraph::Subgraph;

    const API_SCHEMA: &str = r#"
        type Query { t: T ts: [T] }
        type Mutation { createT: T updateT: T }
        type T { id: ID! name: String price: Int }
    "#;
    const PRODUCTS: &str = r#"
        type Query { t: T ts: [T] }
        type Mutation { createT: T updateT: T }
        type T @key(fields: "id") { id: ID! name: String }
    "#;
    const PRICES: &str = r#"
        type Query { prices: Int }
        type T @key(fields: "id") { id: ID! price: Int }
    "#;

    fn build_planner(config: QueryPlannerConfig) -> QueryPlanner {
        let supergraph = Supergraph::new(
            API_SCHEMA,
            [
                Subgraph::new("products", "http://products", PRODUCTS),
                Subgraph::new("prices", "http://prices", PRICES),
            ],
        )
        .unwrap();
        QueryPlanner::new(&supergraph, config).unwrap()
    }

    fn compute(planner: &QueryPlanner, query: &str) -> Result<OperationPaths, FederationError> {
        let document =
            ExecutableDocument::parse_and_validate(planner.api_schema().schema(), query, "q.graphql")
                .unwrap();
        planner.compute_operation_paths(&document, None, QueryPlanOptions::default())
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: QueryPlannerConfig =
            serde_json::from_str(r#"{ "debug": { "pathsLimit": 3 } }"#).unwrap();
        assert_eq!(config.debug.paths_limit, Some(3));
        assert!(!config.debug.disable_non_local_selections_check);
        let config: QueryPlannerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, QueryPlannerConfig::default());
    }

    #[test]
    fn override_conditions_dedupe_labels() {
        let conditions: EnabledOverrideConditions =
            ["b".to_owned(), "a".to_owned(), "b".to_owned()].into_iter().collect();
        assert_eq!(conditions.len(), 2);
        assert!(conditions.contains("a"));
        assert_eq!(
            conditions,
            ["a".to_owned(), "b".to_owned()].into_iter().collect()
        );
    }

    #[test]
    fn every_leaf_selection_gets_a_branch() {
        let planner = build_planner(QueryPlannerConfig::default());
        let paths = compute(&planner, "{ t { id name price } }").unwrap();
        let response_paths: Vec<_> = paths
            .branches()
            .iter()
            .map(|branch| branch.response_path().join("."))
            .collect();
        assert_eq!(response_paths, ["t.id", "t.name", "t.price"]);
        assert!(paths.branches().iter().all(|branch| branch.option_count() >= 1));
        assert_eq!(paths.statistics().closed_branch_count, 3);
        assert!(paths.statistics().explored_option_count >= 4);
    }

    #[test]
    fn remote_fields_jump_once() {
        let planner = build_planner(QueryPlannerConfig::default());
        let paths = compute(&planner, "{ t { price } }").unwrap();
        let [branch] = paths.branches() else {
            panic!("expected a single branch, got {paths}");
        };
        assert_eq!(branch.min_subgraph_jumps().unwrap(), Some(1));
        assert_eq!(branch.option_subgraphs().unwrap(), [["prices"]]);
    }

    #[test]
    fn query_branches_are_merged_into_one_tree() {
        let planner = build_planner(QueryPlannerConfig::default());
        let paths = compute(&planner, "{ t { id name } }").unwrap();
        let tree = paths.to_path_tree().unwrap();
        let rendered = tree.to_string();
        // A single entering edge and a single `t` edge, with both leaves under it.
        assert_eq!(rendered.matches("Query(products)").count(), 1, "{rendered}");
        assert_eq!(rendered.matches("t = T(products)").count(), 1, "{rendered}");
        assert!(rendered.contains("id = ID(products)"), "{rendered}");
        assert!(rendered.contains("name = String(products)"), "{rendered}");
    }

    #[test]
    fn mutation_fields_stay_distinct_in_the_tree() {
        let planner = build_planner(QueryPlannerConfig::default());
        let paths = compute(
            &planner,
            "mutation { a: createT { id name } b: createT { id } }",
        )
        .unwrap();
        assert!(paths.is_mutation());
        let rendered = paths.path_tree_to_string().unwrap();
        // One entering edge per top-level field, and each field's leaves merged under it.
        assert_eq!(rendered.matches("Mutation(products)").count(), 2, "{rendered}");
        assert_eq!(rendered.matches("name = String(products)").count(), 1, "{rendered}");
    }

    #[test]
    fn named_operations_are_selected() {
        let planner = build_planner(QueryPlannerConfig::default());
        let document = ExecutableDocument::parse_and_validate(
            planner.api_schema().schema(),
            "query A { t { id } } query B { ts { name } }",
            "q.graphql",
        )
        .unwrap();
        let paths = planner
            .compute_operation_paths(&document, Some("B"), QueryPlanOptions::default())
            .unwrap();
        assert_eq!(paths.operation_name(), Some("B"));
        assert_eq!(paths.branches()[0].response_path(), ["ts", "name"]);

        let error = planner
            .compute_operation_paths(&document, Some("C"), QueryPlanOptions::default())
            .unwrap_err();
        assert_eq!(error.to_string(), "Unknown operation named \"C\"");
    }

    #[test]
    fn paths_limit_aborts_planning() {
        let planner = build_planner(QueryPlannerConfig {
            debug: QueryPlannerDebugConfig {
                paths_limit: Some(0),
                ..Default::default()
            },
        });
        let error = compute(&planner, "{ t { id } }").unwrap_err();
        assert!(
            matches!(
                error.errors().as_slice(),
                [SingleFederationError::PathsLimitExceeded { limit: 0, .. }]
            ),
            "{error}"
        );
    }

    #[test]
    fn non_local_selections_are_estimated_unless_disabled() {
        let planner = build_planner(QueryPlannerConfig::default());
        let paths = compute(&planner, "{ t { id price } }").unwrap();
        assert!(paths.statistics().non_local_selections_estimate > 0);

        let planner = build_planner(QueryPlannerConfig {
            debug: QueryPlannerDebugConfig {
                disable_non_local_selections_check: true,
                ..Default::default()
            },
        });
        let paths = compute(&planner, "{ t { id price } }").unwrap();
        assert_eq!(paths.statistics().non_local_selections_estimate, 0);
    }
}
