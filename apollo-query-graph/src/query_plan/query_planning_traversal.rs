use std::sync::Arc;

use petgraph::graph::NodeIndex;
use tracing::debug;
use tracing::trace;

use crate::error::FederationError;
use crate::error::SingleFederationError;
use crate::operation::Selection;
use crate::operation::SelectionSet;
use crate::query_graph::QueryGraph;
use crate::query_graph::condition_resolver::CachingConditionResolver;
use crate::query_graph::condition_resolver::ConditionResolverCache;
use crate::query_graph::graph_path::OpGraphPath;
use crate::query_graph::graph_path::operation::IndirectPathsCache;
use crate::query_graph::graph_path::operation::SimultaneousPathsWithLazyIndirectPaths;
use crate::query_graph::graph_path::operation::advance_simultaneous_paths_with_operation;
use crate::query_plan::query_planner::ClosedBranch;
use crate::query_plan::query_planner::EnabledOverrideConditions;
use crate::query_plan::query_planner::QueryPlannerConfig;
use crate::query_plan::query_planner::QueryPlanningStatistics;
use crate::schema::ValidFederationSchema;
use crate::utils::logging::snapshot;

pub(crate) struct QueryPlanningParameters<'a> {
    /// API schema of the graph.
    pub(crate) supergraph_schema: ValidFederationSchema,
    /// The federated query graph used for query planning.
    pub(crate) federated_query_graph: Arc<QueryGraph>,
    /// The federated root node of the operation's root kind.
    pub(crate) head: NodeIndex,
    pub(crate) config: &'a QueryPlannerConfig,
    pub(crate) override_conditions: &'a EnabledOverrideConditions,
    pub(crate) condition_resolver_cache: &'a ConditionResolverCache,
    pub(crate) indirect_paths_cache: &'a IndirectPathsCache,
}

/// A selection that still has to be advanced, with the options reaching its parent.
struct OpenBranch {
    selection: Selection,
    response_path: Vec<String>,
    options: Vec<SimultaneousPathsWithLazyIndirectPaths>,
}

/// Walks the operation depth-first, advancing every option of a parent selection with each of
/// its sub-selections, until every leaf selection is closed.
pub(crate) struct QueryPlanningTraversal<'a, 'stats> {
    parameters: QueryPlanningParameters<'a>,
    condition_resolver: CachingConditionResolver<'a>,
    open_branches: Vec<OpenBranch>,
    closed_branches: Vec<ClosedBranch>,
    statistics: &'stats mut QueryPlanningStatistics,
}

impl<'a, 'stats> QueryPlanningTraversal<'a, 'stats> {
    #[cfg_attr(
        feature = "snapshot_tracing",
        tracing::instrument(level = "trace", skip_all, name = "QueryPlanningTraversal::new")
    )]
    pub(crate) fn new(
        parameters: QueryPlanningParameters<'a>,
        selection_set: &SelectionSet,
        statistics: &'stats mut QueryPlanningStatistics,
    ) -> Result<Self, FederationError> {
        let condition_resolver = CachingConditionResolver::new(
            parameters.federated_query_graph.clone(),
            parameters.supergraph_schema.clone(),
            parameters.override_conditions,
            parameters.condition_resolver_cache,
            parameters.indirect_paths_cache,
        );
        let initial_path =
            OpGraphPath::new(parameters.federated_query_graph.clone(), parameters.head)?;
        let initial_options = vec![SimultaneousPathsWithLazyIndirectPaths::new(
            initial_path.into(),
            Default::default(),
            Default::default(),
            Default::default(),
        )];

        let mut traversal = Self {
            parameters,
            condition_resolver,
            open_branches: Vec::new(),
            closed_branches: Vec::new(),
            statistics,
        };
        traversal.push_open_branches(selection_set, &[], &initial_options);
        Ok(traversal)
    }

    fn push_open_branches(
        &mut self,
        selection_set: &SelectionSet,
        response_path: &[String],
        options: &[SimultaneousPathsWithLazyIndirectPaths],
    ) {
        // Pushed in reverse so that branches are popped in document order.
        for selection in selection_set.iter().rev() {
            self.open_branches.push(OpenBranch {
                selection: selection.clone(),
                response_path: response_path.to_vec(),
                options: options.to_vec(),
            });
        }
    }

    #[cfg_attr(
        feature = "snapshot_tracing",
        tracing::instrument(level = "trace", skip_all, name = "QueryPlanningTraversal::find_closed_branches")
    )]
    pub(crate) fn find_closed_branches(mut self) -> Result<Vec<ClosedBranch>, FederationError> {
        while let Some(branch) = self.open_branches.pop() {
            self.handle_open_branch(branch)?;
        }
        Ok(self.closed_branches)
    }

    fn handle_open_branch(&mut self, branch: OpenBranch) -> Result<(), FederationError> {
        let OpenBranch {
            selection,
            mut response_path,
            options,
        } = branch;
        let operation_element = selection.element();
        response_path.push(response_path_element(&selection));
        debug!(
            "Handling open branch {} with {} option(s)",
            response_path.join("."),
            options.len()
        );

        let mut new_options = Vec::new();
        let mut any_advanced = false;
        for mut option in options {
            self.statistics.explored_option_count += 1;
            let Some(followups) = advance_simultaneous_paths_with_operation(
                &self.parameters.supergraph_schema,
                &mut option,
                &operation_element,
                &mut self.condition_resolver,
                self.parameters.override_conditions,
            )?
            else {
                continue;
            };
            any_advanced = true;
            new_options.extend(followups);
        }

        if !any_advanced {
            return Err(SingleFederationError::NoPlanFound {
                message: format!(
                    "Cannot find a way to collect \"{operation_element}\" at \"{}\" from any subgraph",
                    response_path.join(".")
                ),
            }
            .into());
        }
        if new_options.is_empty() {
            // Every option proved that the selection cannot match any runtime type.
            trace!("Selection at {} can be skipped", response_path.join("."));
            return Ok(());
        }
        if let Some(limit) = self.parameters.config.debug.paths_limit
            && new_options.len() > limit as usize
        {
            return Err(SingleFederationError::PathsLimitExceeded {
                limit,
                message: format!(
                    "{} options were generated for \"{}\"",
                    new_options.len(),
                    response_path.join(".")
                ),
            }
            .into());
        }
        snapshot!(
            "SimultaneousPaths",
            new_options
                .iter()
                .map(|option| option.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
            "new options"
        );

        match selection.selection_set() {
            Some(selection_set) if !selection_set.is_empty() => {
                self.push_open_branches(selection_set, &response_path, &new_options);
            }
            _ => self.closed_branches.push(ClosedBranch {
                response_path,
                options: new_options.into_iter().map(|option| option.paths).collect(),
            }),
        }
        Ok(())
    }
}

fn response_path_element(selection: &Selection) -> String {
    match selection {
        Selection::Field(field_selection) => field_selection.field.response_name().to_string(),
        Selection::InlineFragment(fragment_selection) => {
            match &fragment_selection.inline_fragment.type_condition_position {
                Some(type_condition) => format!("... on {}", type_condition.type_name()),
                None => "...".to_owned(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use apollo_compiler::ExecutableDocument;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::operation::Operation;
    use crate::query_graph::test_support::federated_graph;
    use crate::schema::position::SchemaRootDefinitionKind;

    const API_SCHEMA: &str = r#"
        type Query { i: I }
        interface I { id: ID! }
        type A implements I { id: ID! a: Int }
        type B implements I { id: ID! b: Int }
    "#;
    const SUBGRAPH: &str = r#"
        type Query { i: I }
        interface I { id: ID! }
        type A implements I { id: ID! a: Int }
        type B implements I { id: ID! b: Int }
    "#;

    struct Fixture {
        graph: Arc<QueryGraph>,
        config: QueryPlannerConfig,
        override_conditions: EnabledOverrideConditions,
        cache: ConditionResolverCache,
        indirect_paths_cache: IndirectPathsCache,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                graph: federated_graph(API_SCHEMA, &[("S", SUBGRAPH)]),
                config: QueryPlannerConfig::default(),
                override_conditions: Default::default(),
                cache: Default::default(),
                indirect_paths_cache: Default::default(),
            }
        }

        fn closed_branches(
            &self,
            query: &str,
        ) -> Result<(Vec<ClosedBranch>, QueryPlanningStatistics), FederationError> {
            let schema = self.graph.supergraph_schema().unwrap();
            let document =
                ExecutableDocument::parse_and_validate(schema.schema(), query, "q.graphql")
                    .unwrap();
            let operation = Operation::from_operation_document(schema.clone(), &document, None)?;
            let head = self.graph.root_kinds_to_nodes().unwrap()[&SchemaRootDefinitionKind::Query];
            let parameters = QueryPlanningParameters {
                supergraph_schema: schema,
                federated_query_graph: self.graph.clone(),
                head,
                config: &self.config,
                override_conditions: &self.override_conditions,
                condition_resolver_cache: &self.cache,
                indirect_paths_cache: &self.indirect_paths_cache,
            };
            let mut statistics = QueryPlanningStatistics::default();
            let branches =
                QueryPlanningTraversal::new(parameters, &operation.selection_set, &mut statistics)?
                    .find_closed_branches()?;
            Ok((branches, statistics))
        }
    }

    #[test]
    fn branches_close_in_document_order() {
        let fixture = Fixture::new();
        let (branches, statistics) = fixture
            .closed_branches("{ i { id ... on A { a } ... on B { b } } }")
            .unwrap();
        let response_paths: Vec<_> = branches
            .iter()
            .map(|branch| branch.response_path.join("."))
            .collect();
        assert_eq!(response_paths, ["i.id", "i.... on A.a", "i.... on B.b"]);
        // i, then id, the two fragments and their two leaves, one option each.
        assert_eq!(statistics.explored_option_count, 6);
    }

    #[test]
    fn paths_limit_is_checked_per_selection() {
        let mut fixture = Fixture::new();
        fixture.config.debug.paths_limit = Some(1);
        assert!(fixture.closed_branches("{ i { id } }").is_ok());
        fixture.config.debug.paths_limit = Some(0);
        let error = fixture.closed_branches("{ i { id } }").unwrap_err();
        assert_eq!(
            error.to_string(),
            "Exceeded the limit of 0 options for a single selection: 1 options were generated for \"i\""
        );
    }
}
