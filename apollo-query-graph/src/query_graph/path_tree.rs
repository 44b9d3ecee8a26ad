use std::fmt::Display;
use std::fmt::Formatter;
use std::sync::Arc;

use petgraph::graph::EdgeIndex;
use petgraph::graph::NodeIndex;

use crate::error::FederationError;
use crate::internal_error;
use crate::query_graph::QueryGraph;
use crate::query_graph::graph_path::OpGraphPath;
use crate::query_graph::graph_path::OpGraphPathTrigger;

/// Graph paths sharing a start node, merged into a tree. Each tree node is a query graph node, and
/// paths only branch where their (edge, trigger) pairs differ.
///
/// Trigger equality is the `PartialEq` of the trigger type.
#[derive(Debug)]
pub(crate) struct PathTree<TTrigger, TEdge> {
    /// Graph the merged paths live in.
    pub(crate) graph: Arc<QueryGraph>,
    /// Graph node this (sub)tree is rooted at.
    pub(crate) node: NodeIndex,
    /// One child per distinct (edge, trigger) pair leaving this node, in first-seen order.
    pub(crate) childs: Vec<Arc<PathTreeChild<TTrigger, TEdge>>>,
}

#[derive(Debug)]
pub(crate) struct PathTreeChild<TTrigger, TEdge> {
    /// Edge from the parent.
    pub(crate) edge: TEdge,
    /// What made the paths take `edge`.
    pub(crate) trigger: Arc<TTrigger>,
    /// Merged condition paths of `edge`, if it has conditions.
    pub(crate) conditions: Option<Arc<OpPathTree>>,
    pub(crate) tree: Arc<PathTree<TTrigger, TEdge>>,
}

/// Path tree of operation-driven paths.
pub(crate) type OpPathTree = PathTree<OpGraphPathTrigger, Option<EdgeIndex>>;

/// One step of a path being merged into a tree.
struct PathElement<'path, TTrigger, TEdge> {
    edge: TEdge,
    trigger: &'path Arc<TTrigger>,
    conditions: Option<&'path Arc<OpPathTree>>,
}

impl<TTrigger, TEdge> PathTree<TTrigger, TEdge>
where
    TTrigger: PartialEq,
    TEdge: Copy + PartialEq + Into<Option<EdgeIndex>>,
{
    pub(crate) fn leaf(graph: Arc<QueryGraph>, node: NodeIndex) -> Self {
        Self {
            graph,
            node,
            childs: Vec::new(),
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.childs.is_empty()
    }

    fn with_childs(&self, childs: Vec<Arc<PathTreeChild<TTrigger, TEdge>>>) -> Self {
        Self {
            graph: self.graph.clone(),
            node: self.node,
            childs,
        }
    }

    fn find_child(&self, edge: TEdge, trigger: &TTrigger) -> Option<usize> {
        self.childs
            .iter()
            .position(|child| child.edge == edge && *child.trigger == *trigger)
    }

    /// Merges the given elements, starting at this tree's node, and returns the resulting tree.
    /// Children that are not on the merged path are shared with `self`.
    fn merge_elements(
        &self,
        elements: &[PathElement<'_, TTrigger, TEdge>],
    ) -> Result<Self, FederationError> {
        let Some((first, rest)) = elements.split_first() else {
            return Ok(self.with_childs(self.childs.clone()));
        };
        let mut childs = self.childs.clone();
        match self.find_child(first.edge, first.trigger) {
            Some(index) => {
                let existing = &childs[index];
                let child = PathTreeChild {
                    edge: existing.edge,
                    trigger: existing.trigger.clone(),
                    conditions: merge_conditions(
                        existing.conditions.as_ref(),
                        first.conditions,
                    )?,
                    tree: Arc::new(existing.tree.merge_elements(rest)?),
                };
                childs[index] = Arc::new(child);
            }
            None => {
                let tail = match first.edge.into() {
                    Some(edge) => self.graph.edge_endpoints(edge)?.1,
                    None => self.node,
                };
                let tree = PathTree::leaf(self.graph.clone(), tail).merge_elements(rest)?;
                childs.push(Arc::new(PathTreeChild {
                    edge: first.edge,
                    trigger: first.trigger.clone(),
                    conditions: first.conditions.cloned(),
                    tree: Arc::new(tree),
                }));
            }
        }
        Ok(self.with_childs(childs))
    }

    /// Merges two trees rooted at the same node. Children with the same edge and trigger are merged
    /// recursively, and any subtree only present on one side is shared as-is.
    pub(crate) fn merge(self: &Arc<Self>, other: &Arc<Self>) -> Result<Arc<Self>, FederationError> {
        if Arc::ptr_eq(self, other) {
            return Ok(self.clone());
        }
        if !Arc::ptr_eq(&self.graph, &other.graph) {
            return Err(internal_error!("Cannot merge path trees built on different graphs"));
        }
        if self.node != other.node {
            return Err(internal_error!(
                "Cannot merge path trees rooted at different nodes ({} and {})",
                self.node.index(),
                other.node.index(),
            ));
        }
        let mut childs = self.childs.clone();
        for other_child in &other.childs {
            match self.find_child(other_child.edge, &other_child.trigger) {
                Some(index) => {
                    let existing = &childs[index];
                    if Arc::ptr_eq(existing, other_child) {
                        continue;
                    }
                    let child = PathTreeChild {
                        edge: existing.edge,
                        trigger: existing.trigger.clone(),
                        conditions: merge_conditions(
                            existing.conditions.as_ref(),
                            other_child.conditions.as_ref(),
                        )?,
                        tree: existing.tree.merge(&other_child.tree)?,
                    };
                    childs[index] = Arc::new(child);
                }
                None => childs.push(other_child.clone()),
            }
        }
        Ok(Arc::new(self.with_childs(childs)))
    }

    /// Appends the children of `other` to the children of `self`, without merging children with
    /// the same edge and trigger. This keeps sibling paths distinct and in order, which mutation
    /// roots need.
    pub(crate) fn concat(self: &Arc<Self>, other: &Arc<Self>) -> Result<Arc<Self>, FederationError> {
        if !Arc::ptr_eq(&self.graph, &other.graph) || self.node != other.node {
            return Err(internal_error!(
                "Cannot concatenate path trees that are not rooted at the same node"
            ));
        }
        let childs = self
            .childs
            .iter()
            .chain(other.childs.iter())
            .cloned()
            .collect();
        Ok(Arc::new(self.with_childs(childs)))
    }

    /// Whether every node of this tree belongs to the subgraph of the root node. Conditions are not
    /// inspected.
    pub(crate) fn is_all_in_same_subgraph(&self) -> Result<bool, FederationError> {
        let source = &self.graph.node_weight(self.node)?.source;
        self.is_all_in_same_subgraph_internal(source)
    }

    fn is_all_in_same_subgraph_internal(&self, target: &str) -> Result<bool, FederationError> {
        if *self.graph.node_weight(self.node)?.source != *target {
            return Ok(false);
        }
        for child in &self.childs {
            if !child.tree.is_all_in_same_subgraph_internal(target)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl OpPathTree {
    /// Builds the tree of the given paths, which must all start at `node`.
    pub(crate) fn from_op_paths<'path>(
        graph: Arc<QueryGraph>,
        node: NodeIndex,
        paths: impl IntoIterator<Item = &'path OpGraphPath>,
    ) -> Result<Self, FederationError> {
        let mut tree = Self::leaf(graph, node);
        for path in paths {
            tree = tree.merge_op_path(path)?;
        }
        Ok(tree)
    }

    /// Returns a new tree containing the paths of `self` plus `path`.
    pub(crate) fn merge_path(
        self: &Arc<Self>,
        path: &OpGraphPath,
    ) -> Result<Arc<Self>, FederationError> {
        Ok(Arc::new(self.merge_op_path(path)?))
    }

    fn merge_op_path(&self, path: &OpGraphPath) -> Result<Self, FederationError> {
        if path.head() != self.node {
            return Err(internal_error!(
                "Cannot merge path starting at {} into a tree rooted at {}",
                self.graph.node_weight(path.head())?,
                self.graph.node_weight(self.node)?,
            ));
        }
        let elements: Vec<_> = path
            .iter()
            .map(|(edge, trigger, conditions)| PathElement {
                edge,
                trigger,
                conditions,
            })
            .collect();
        self.merge_elements(&elements)
    }
}

fn merge_conditions(
    left: Option<&Arc<OpPathTree>>,
    right: Option<&Arc<OpPathTree>>,
) -> Result<Option<Arc<OpPathTree>>, FederationError> {
    Ok(match (left, right) {
        (Some(left), Some(right)) => Some(left.merge(right)?),
        (Some(conditions), None) | (None, Some(conditions)) => Some(conditions.clone()),
        (None, None) => None,
    })
}

impl<TTrigger, TEdge> PathTree<TTrigger, TEdge>
where
    TTrigger: Display,
    TEdge: Copy + Into<Option<EdgeIndex>>,
{
    fn fmt_internal(
        &self,
        f: &mut Formatter<'_>,
        indent: &str,
        include_conditions: bool,
    ) -> std::fmt::Result {
        let node = self.graph.node_weight(self.node).map_err(|_| std::fmt::Error)?;
        if self.childs.is_empty() {
            return write!(f, "{node}");
        }
        write!(f, "{node}:")?;
        let child_indent = format!("{indent}  ");
        for child in &self.childs {
            f.write_str("\n")?;
            f.write_str(indent)?;
            match child.edge.into() {
                Some(edge) => write!(f, " -> [{}] ", edge.index())?,
                None => f.write_str(" -> [null] ")?,
            }
            if include_conditions && let Some(conditions) = &child.conditions {
                writeln!(f, "!! {{")?;
                write!(f, "{indent}     ")?;
                conditions.fmt_internal(f, &format!("{indent}     "), true)?;
                write!(f, "\n{indent} }} ")?;
            }
            write!(f, "{} = ", child.trigger)?;
            child.tree.fmt_internal(f, &child_indent, include_conditions)?;
        }
        Ok(())
    }

    /// Renders the tree along with the trees of the conditions of each edge.
    pub(crate) fn to_string_with_conditions(&self) -> String {
        struct WithConditions<'tree, TTrigger, TEdge>(&'tree PathTree<TTrigger, TEdge>);
        impl<TTrigger, TEdge> Display for WithConditions<'_, TTrigger, TEdge>
        where
            TTrigger: Display,
            TEdge: Copy + Into<Option<EdgeIndex>>,
        {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                self.0.fmt_internal(f, "", true)
            }
        }
        WithConditions(self).to_string()
    }
}

impl<TTrigger, TEdge> Display for PathTree<TTrigger, TEdge>
where
    TTrigger: Display,
    TEdge: Copy + Into<Option<EdgeIndex>>,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.fmt_internal(f, "", false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use apollo_compiler::name;
    use petgraph::visit::EdgeRef;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::operation::Field;
    use crate::query_graph::condition_resolver::ConditionResolution;
    use crate::query_graph::graph_path::OpGraphPathContext;
    use crate::query_graph::graph_path::OpPathElement;
    use crate::query_graph::test_support::federated_graph;
    use crate::schema::position::CompositeTypeDefinitionPosition;
    use crate::schema::position::ObjectTypeDefinitionPosition;

    const API_SCHEMA: &str = r#"
        type Query { t: T }
        type T { id: ID! a: Int b: Int }
    "#;

    const SUBGRAPH: &str = r#"
        type Query { t: T }
        type T { id: ID! a: Int b: Int }
    "#;

    /// The path `[query] -> Query(S) -> T(S)` followed by the given field of `T`.
    fn path_to_field(graph: &Arc<QueryGraph>, field_name: &str) -> OpGraphPath {
        let root = graph
            .root_kinds_to_nodes()
            .unwrap()
            .values()
            .copied()
            .next()
            .unwrap();
        let schema = graph.supergraph_schema().unwrap();
        let mut path = OpGraphPath::new(graph.clone(), root).unwrap();
        let entering = graph.out_edges(root)[0].id();
        path = path
            .add(
                OpGraphPathContext::default().into(),
                Some(entering),
                ConditionResolution::no_conditions(),
            )
            .unwrap();
        let query_type = CompositeTypeDefinitionPosition::Object(ObjectTypeDefinitionPosition::new(
            name!("Query"),
        ));
        let t_type =
            CompositeTypeDefinitionPosition::Object(ObjectTypeDefinitionPosition::new(name!("T")));
        for field_position in [
            query_type.field(name!("t")),
            t_type.field(apollo_compiler::Name::new(field_name).unwrap()),
        ] {
            let edge = graph
                .edge_for_field(path.tail(), field_position.field_name(), &Default::default())
                .unwrap()
                .unwrap();
            let field = Field::from_position(&schema, field_position);
            path = path
                .add(
                    OpPathElement::Field(field).into(),
                    Some(edge),
                    ConditionResolution::no_conditions(),
                )
                .unwrap();
        }
        path
    }

    #[test]
    fn merging_a_tree_with_itself_is_a_no_op() {
        let graph = federated_graph(API_SCHEMA, &[("S", SUBGRAPH)]);
        let path = path_to_field(&graph, "a");
        let tree = Arc::new(OpPathTree::from_op_paths(graph.clone(), path.head(), [&path]).unwrap());
        let merged = tree.merge(&tree).unwrap();
        assert!(Arc::ptr_eq(&merged, &tree));
    }

    #[test]
    fn merging_paths_with_a_shared_prefix_shares_children() {
        let graph = federated_graph(API_SCHEMA, &[("S", SUBGRAPH)]);
        let path_a = path_to_field(&graph, "a");
        let path_b = path_to_field(&graph, "b");
        let tree_a = Arc::new(OpPathTree::from_op_paths(graph.clone(), path_a.head(), [&path_a]).unwrap());
        let tree_b = Arc::new(OpPathTree::from_op_paths(graph.clone(), path_b.head(), [&path_b]).unwrap());
        let merged = tree_a.merge(&tree_b).unwrap();

        // [query] -> Query -> T are shared, then the tree forks into a and b at T.
        assert_eq!(merged.childs.len(), 1);
        let query = &merged.childs[0].tree;
        assert_eq!(query.childs.len(), 1);
        let t = &query.childs[0].tree;
        assert_eq!(t.childs.len(), 2);
        assert!(t.childs.iter().all(|child| child.tree.childs.is_empty()));
        assert!(!merged.is_all_in_same_subgraph().unwrap());
        assert!(query.is_all_in_same_subgraph().unwrap());

        let same = Arc::new(OpPathTree::from_op_paths(graph, path_a.head(), [&path_a, &path_b]).unwrap());
        assert_eq!(same.to_string(), merged.to_string());
    }

    #[test]
    fn concatenating_keeps_duplicate_children() {
        let graph = federated_graph(API_SCHEMA, &[("S", SUBGRAPH)]);
        let path = path_to_field(&graph, "a");
        let tree = Arc::new(OpPathTree::from_op_paths(graph.clone(), path.head(), [&path]).unwrap());
        let other = Arc::new(OpPathTree::from_op_paths(graph, path.head(), [&path]).unwrap());
        assert_eq!(tree.merge(&other).unwrap().childs.len(), 1);
        assert_eq!(tree.concat(&other).unwrap().childs.len(), 2);
    }

    #[test]
    fn displays_each_edge_with_its_trigger() {
        let graph = federated_graph(API_SCHEMA, &[("S", SUBGRAPH)]);
        let path = path_to_field(&graph, "a");
        let tree = OpPathTree::from_op_paths(graph.clone(), path.head(), [&path]).unwrap();
        let rendered = tree.to_string();
        assert!(rendered.starts_with("[query](_)*:"), "{rendered}");
        assert!(rendered.contains("= Query(S)*:"), "{rendered}");
        assert!(rendered.contains("t = T(S):"), "{rendered}");
        assert!(rendered.ends_with("a = Int(S)"), "{rendered}");
    }
}
