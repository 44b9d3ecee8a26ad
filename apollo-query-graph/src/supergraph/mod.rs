use std::sync::Arc;

use apollo_compiler::collections::IndexMap;

use crate::error::FederationError;
use crate::error::MultipleFederationErrors;
use crate::error::SingleFederationError;
use crate::query_graph::FEDERATED_GRAPH_ROOT_SOURCE;
use crate::schema::ValidFederationSchema;
use crate::subgraph::Subgraph;
use crate::subgraph::ValidSubgraph;

/// The input of federated query graph construction: the API schema that clients query, and the
/// subgraphs that serve it.
#[derive(Debug, Clone)]
pub struct Supergraph {
    api_schema: ValidFederationSchema,
    subgraphs: IndexMap<Arc<str>, ValidSubgraph>,
}

impl Supergraph {
    pub fn new(
        api_schema_sdl: &str,
        subgraphs: impl IntoIterator<Item = Subgraph>,
    ) -> Result<Self, FederationError> {
        let api_schema = ValidFederationSchema::parse(api_schema_sdl, "api_schema.graphql")?;
        Self::from_parts(api_schema, subgraphs)
    }

    pub fn from_parts(
        api_schema: ValidFederationSchema,
        subgraphs: impl IntoIterator<Item = Subgraph>,
    ) -> Result<Self, FederationError> {
        let mut errors = MultipleFederationErrors::default();
        let mut valid_subgraphs = IndexMap::default();
        for subgraph in subgraphs {
            if subgraph.name == FEDERATED_GRAPH_ROOT_SOURCE {
                errors.push(
                    SingleFederationError::InvalidSubgraph {
                        subgraph: subgraph.name.clone(),
                        message: format!(
                            "\"{FEDERATED_GRAPH_ROOT_SOURCE}\" is reserved and cannot be used as a subgraph name"
                        ),
                    }
                    .into(),
                );
                continue;
            }
            if valid_subgraphs.contains_key(subgraph.name.as_str()) {
                errors.push(
                    SingleFederationError::InvalidSubgraph {
                        subgraph: subgraph.name.clone(),
                        message: "A subgraph with this name was already provided".to_owned(),
                    }
                    .into(),
                );
                continue;
            }
            match subgraph.parse_and_expand() {
                Ok(valid) => {
                    valid_subgraphs.insert(valid.name.clone(), valid);
                }
                Err(error) => errors.push(error),
            }
        }
        errors.into_result()?;
        Ok(Self {
            api_schema,
            subgraphs: valid_subgraphs,
        })
    }

    pub fn api_schema(&self) -> &ValidFederationSchema {
        &self.api_schema
    }

    pub fn subgraphs(&self) -> impl Iterator<Item = &ValidSubgraph> {
        self.subgraphs.values()
    }

    pub fn subgraph(&self, name: &str) -> Option<&ValidSubgraph> {
        self.subgraphs.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const API_SCHEMA: &str = "type Query { t: Int }";

    #[test]
    fn rejects_duplicate_and_reserved_names() {
        let subgraph = |name: &str| Subgraph::new(name, "http://s", "type Query { t: Int }");
        let error = Supergraph::new(API_SCHEMA, [subgraph("A"), subgraph("A"), subgraph("_")])
            .unwrap_err();
        assert_eq!(error.errors().len(), 2, "{error}");
        assert!(Supergraph::new(API_SCHEMA, [subgraph("A"), subgraph("B")]).is_ok());
    }
}
