//! Federated query graphs and the path search that query planning is built on.
//!
//! A [`Supergraph`] (an API schema plus the subgraphs serving it) is turned into a federated
//! [`QueryGraph`](query_graph::QueryGraph), a directed multigraph whose nodes are
//! `(type, subgraph)` pairs and whose edges are field collections, type downcasts, and
//! cross-subgraph jumps guarded by `@key` or `@requires` conditions. The [`QueryPlanner`] then
//! enumerates, for every leaf selection of an operation, the graph paths able to collect it.
//!
//! ## Usage
//!
//! This crate is internal to the query planner and not intended to be used directly. Any version
//! may have breaking API changes.

#![warn(
    rustdoc::broken_intra_doc_links,
    unreachable_pub,
    unreachable_patterns,
    unused,
    unused_qualifications,
    dead_code,
    while_true,
    unconditional_panic,
    clippy::all
)]

pub mod error;
pub(crate) mod link;
pub mod operation;
pub mod query_graph;
pub mod query_plan;
pub mod schema;
pub mod subgraph;
pub(crate) mod supergraph;
pub(crate) mod utils;

pub use crate::query_graph::build_federated_query_graph;
pub use crate::query_graph::build_query_graph;
pub use crate::query_plan::query_planner::QueryPlanOptions;
pub use crate::query_plan::query_planner::QueryPlanner;
pub use crate::query_plan::query_planner::QueryPlannerConfig;
pub use crate::subgraph::Subgraph;
pub use crate::supergraph::Supergraph;
