//! Debug renderings of query graphs: GraphViz (with one cluster per subgraph for federated
//! graphs) and Mermaid flowcharts.

use std::fmt::Write;
use std::sync::Arc;

use petgraph::dot::Config;
use petgraph::dot::Dot;
use petgraph::graph::EdgeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::visit::EdgeRef;

use crate::query_graph::QueryGraph;
use crate::query_graph::QueryGraphEdge;
use crate::query_graph::QueryGraphNode;

type StableInnerGraph = StableGraph<QueryGraphNode, QueryGraphEdge>;

fn edge_label(edge: &QueryGraphEdge) -> String {
    edge.to_string().replace('"', "\\\"")
}

fn label_edge(edge: &QueryGraphEdge) -> String {
    let label = edge_label(edge);
    if label.is_empty() {
        String::new()
    } else {
        format!("label=\"{label}\"")
    }
}

fn label_node(node: &QueryGraphNode) -> String {
    format!("label=\"{}\"", node.type_)
}

/// Renders the query graph in GraphViz format.
pub fn to_dot(graph: &QueryGraph) -> Result<String, std::fmt::Error> {
    if graph.sources.len() > 1 {
        return to_dot_federated(graph);
    }
    let config = [Config::NodeNoLabel, Config::EdgeNoLabel];
    Ok(Dot::with_attr_getters(
        &graph.graph,
        &config,
        &(|_, edge_ref| label_edge(edge_ref.weight())),
        &(|_, (_, node)| label_node(node)),
    )
    .to_string())
}

fn to_dot_federated(graph: &QueryGraph) -> Result<String, std::fmt::Error> {
    fn is_within_cluster(graph: &StableInnerGraph, cluster: &Arc<str>, edge: EdgeIndex) -> bool {
        graph
            .edge_endpoints(edge)
            .is_some_and(|(head, tail)| graph[head].source == *cluster && graph[tail].source == *cluster)
    }

    fn label_cluster_node(node: &QueryGraphNode) -> String {
        let provide_id = node
            .provide_id
            .map(|id| format!("#{id}"))
            .unwrap_or_default();
        format!(r#"label="{}{}@{}""#, node.type_, provide_id, node.source)
    }

    // Stable indices, so that clusters keep the node numbering of the whole graph.
    let stable_graph = StableGraph::from(graph.graph.clone());
    let cluster_config = [
        Config::NodeNoLabel,
        Config::EdgeNoLabel,
        Config::GraphContentOnly,
    ];

    let mut dot = String::new();
    writeln!(dot, r#"digraph "{}" {{"#, graph.name())?;
    for cluster in graph.sources.keys() {
        if **cluster == *graph.name() {
            continue;
        }
        let cluster_graph: StableInnerGraph = stable_graph.filter_map(
            |_, node| (node.source == *cluster).then(|| node.clone()),
            |edge, weight| {
                is_within_cluster(&stable_graph, cluster, edge).then(|| weight.clone())
            },
        );
        let content = Dot::with_attr_getters(
            &cluster_graph,
            &cluster_config,
            &(|_, edge_ref| label_edge(edge_ref.weight())),
            &(|_, (_, node)| label_cluster_node(node)),
        );
        writeln!(dot, r#"  subgraph "cluster_{cluster}" {{"#)?;
        writeln!(dot, r#"    label = "Subgraph \"{cluster}\"";"#)?;
        writeln!(dot, r#"    color = "black";"#)?;
        writeln!(dot, r#"    style = "";"#)?;
        write!(dot, "{content}")?;
        writeln!(dot, "  }}")?;
    }

    for node in stable_graph.node_indices() {
        let weight = &stable_graph[node];
        if *weight.source == *graph.name() {
            writeln!(dot, "  {} [{}]", node.index(), label_node(weight))?;
        }
    }
    for edge in stable_graph.edge_indices() {
        let Some((head, tail)) = stable_graph.edge_endpoints(edge) else {
            continue;
        };
        if stable_graph[head].source != stable_graph[tail].source {
            writeln!(
                dot,
                "  {} -> {} [{}]",
                head.index(),
                tail.index(),
                label_edge(&stable_graph[edge])
            )?;
        }
    }
    writeln!(dot, "}}")?;
    Ok(dot)
}

/// Renders the query graph as a Mermaid flowchart, with one subgraph block per source.
pub fn to_mermaid(graph: &QueryGraph) -> Result<String, std::fmt::Error> {
    let mut mermaid = String::from("flowchart TD\n");
    for cluster in graph.sources.keys() {
        let in_cluster: Vec<_> = graph
            .graph
            .node_indices()
            .filter(|node| graph.graph[*node].source == *cluster)
            .collect();
        if in_cluster.is_empty() {
            continue;
        }
        let is_root_cluster = **cluster == *graph.name() && graph.sources.len() > 1;
        if !is_root_cluster {
            writeln!(mermaid, "  subgraph \"{cluster}\"")?;
        }
        for node in in_cluster {
            writeln!(mermaid, "    node{}[\"{}\"]", node.index(), graph.graph[node])?;
        }
        if !is_root_cluster {
            writeln!(mermaid, "  end")?;
        }
    }
    for edge_ref in graph.graph.edge_references() {
        writeln!(
            mermaid,
            "  node{} -->|\"{}\"| node{}",
            edge_ref.source().index(),
            edge_label(edge_ref.weight()).replace("\\\"", "#quot;"),
            edge_ref.target().index(),
        )?;
    }
    Ok(mermaid)
}
