mod query_plan;
