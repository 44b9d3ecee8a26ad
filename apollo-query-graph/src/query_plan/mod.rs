pub(crate) mod conditions;
pub mod query_planner;
pub(crate) mod query_planning_traversal;

/// The cost of a query graph path or of resolving the conditions of an edge. Lower is better.
pub type QueryPlanCost = f64;
