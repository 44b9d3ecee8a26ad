use std::fmt::Display;
use std::fmt::Formatter;
use std::sync::Arc;

use apollo_compiler::Schema;
use apollo_compiler::ast;

use crate::error::FederationError;
use crate::error::SingleFederationError;
use crate::link::federation_spec_definition::FEDERATION_DEFINITIONS;
use crate::schema::ValidFederationSchema;

/// A subgraph as handed over by composition: a name, the url it is served at, and its SDL.
#[derive(Debug, Clone)]
pub struct Subgraph {
    pub name: String,
    pub url: String,
    pub schema_sdl: String,
}

impl Subgraph {
    pub fn new(name: &str, url: &str, schema_sdl: &str) -> Self {
        Self {
            name: name.to_owned(),
            url: url.to_owned(),
            schema_sdl: schema_sdl.to_owned(),
        }
    }

    /// Parses the subgraph SDL, adds whichever federation definitions it uses without declaring,
    /// and validates the result.
    pub fn parse_and_expand(&self) -> Result<ValidSubgraph, FederationError> {
        let document = ast::Document::parse(&self.schema_sdl, &self.name)
            .map_err(|e| self.invalid(e.errors.to_string()))?;
        let missing_definitions = missing_federation_definitions(&document);

        let mut builder = Schema::builder()
            .adopt_orphan_extensions()
            .parse(&self.schema_sdl, &self.name);
        if !missing_definitions.is_empty() {
            builder = builder.parse(missing_definitions, "federation_definitions.graphql");
        }
        let schema = builder
            .build()
            .map_err(|e| self.invalid(e.errors.to_string()))?
            .validate()
            .map_err(|e| self.invalid(e.errors.to_string()))?;
        Ok(ValidSubgraph {
            name: Arc::from(self.name.as_str()),
            url: self.url.clone(),
            schema: ValidFederationSchema::new(schema)?,
        })
    }

    fn invalid(&self, message: String) -> FederationError {
        SingleFederationError::InvalidSubgraph {
            subgraph: self.name.clone(),
            message,
        }
        .into()
    }
}

fn missing_federation_definitions(document: &ast::Document) -> String {
    let mut declared = Vec::new();
    for definition in &document.definitions {
        match definition {
            ast::Definition::DirectiveDefinition(directive) => {
                declared.push(format!("@{}", directive.name));
            }
            _ => {
                if let Some(name) = definition.name() {
                    declared.push(name.to_string());
                }
            }
        }
    }
    FEDERATION_DEFINITIONS
        .iter()
        .filter(|(name, _)| !declared.iter().any(|declared| declared == name))
        .map(|(_, definition)| *definition)
        .collect::<Vec<_>>()
        .join("\n")
}

/// A parsed and validated subgraph.
#[derive(Debug, Clone)]
pub struct ValidSubgraph {
    pub name: Arc<str>,
    pub url: String,
    pub schema: ValidFederationSchema,
}

impl Display for ValidSubgraph {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "name: {}, url: {}", self.name, self.url)
    }
}
