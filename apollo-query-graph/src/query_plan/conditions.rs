use std::fmt::Display;
use std::fmt::Formatter;
use std::sync::Arc;

use apollo_compiler::Name;
use apollo_compiler::collections::IndexMap;
use apollo_compiler::ast::Value;
use indexmap::map::Entry;

use crate::error::FederationError;
use crate::operation::DirectiveList;

/// The `@skip`/`@include` conditions under which a selection applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Conditions {
    Variables(VariableConditions),
    Boolean(bool),
}

/// Variable name to `true` when the condition is `@skip(if: $name)`, `false` for
/// `@include(if: $name)`. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VariableConditions(Arc<IndexMap<Name, bool>>);

impl Default for Conditions {
    fn default() -> Self {
        Conditions::Boolean(true)
    }
}

impl Conditions {
    pub(crate) fn from_directives(directives: &DirectiveList) -> Result<Self, FederationError> {
        let mut variables: Option<IndexMap<Name, bool>> = None;
        for directive in directives.iter() {
            let negated = match directive.name.as_str() {
                "include" => false,
                "skip" => true,
                _ => continue,
            };
            let value = directive.specified_argument_by_name("if").ok_or_else(|| {
                FederationError::internal(format!(
                    "missing if argument on @{}",
                    if negated { "skip" } else { "include" },
                ))
            })?;
            match &**value {
                Value::Boolean(false) if !negated => return Ok(Self::Boolean(false)),
                Value::Boolean(true) if negated => return Ok(Self::Boolean(false)),
                Value::Boolean(_) => {}
                Value::Variable(name) => {
                    match variables.get_or_insert_with(Default::default).entry(name.clone()) {
                        Entry::Occupied(entry) => {
                            if *entry.get() != negated {
                                return Ok(Self::Boolean(false));
                            }
                        }
                        Entry::Vacant(entry) => {
                            entry.insert(negated);
                        }
                    }
                }
                _ => {
                    return Err(FederationError::internal(format!(
                        "expected boolean or variable `if` argument, got {}",
                        value.serialize().no_indent()
                    )));
                }
            }
        }
        Ok(match variables {
            Some(map) => Self::Variables(VariableConditions(Arc::new(map))),
            None => Self::Boolean(true),
        })
    }

    /// Whether these conditions always hold.
    pub(crate) fn is_true(&self) -> bool {
        matches!(self, Conditions::Boolean(true))
    }

    pub(crate) fn merge(self, other: Self) -> Self {
        match (self, other) {
            // Absorbing element
            (Conditions::Boolean(false), _) | (_, Conditions::Boolean(false)) => {
                Conditions::Boolean(false)
            }

            // Neutral element
            (Conditions::Boolean(true), x) | (x, Conditions::Boolean(true)) => x,

            (Conditions::Variables(mut self_vars), Conditions::Variables(other_vars)) => {
                let vars = Arc::make_mut(&mut self_vars.0);
                for (name, other_negated) in other_vars.0.iter() {
                    match vars.entry(name.clone()) {
                        Entry::Occupied(entry) => {
                            if entry.get() != other_negated {
                                return Conditions::Boolean(false);
                            }
                        }
                        Entry::Vacant(entry) => {
                            entry.insert(*other_negated);
                        }
                    }
                }
                Conditions::Variables(self_vars)
            }
        }
    }
}

impl Display for Conditions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Conditions::Boolean(value) => write!(f, "{value}"),
            Conditions::Variables(variables) => {
                for (i, (name, negated)) in variables.0.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" && ")?;
                    }
                    if *negated {
                        f.write_str("!")?;
                    }
                    write!(f, "${name}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use apollo_compiler::ExecutableDocument;
    use apollo_compiler::Schema;
    use apollo_compiler::executable::Selection;

    use super::*;

    fn field_conditions(query: &str) -> Conditions {
        let schema = Schema::parse_and_validate("type Query { a: Int }", "schema.graphql").unwrap();
        let document = ExecutableDocument::parse_and_validate(&schema, query, "op.graphql").unwrap();
        let operation = document.operations.get(None).unwrap();
        let Selection::Field(field) = &operation.selection_set.selections[0] else {
            panic!("expected a field");
        };
        Conditions::from_directives(&DirectiveList::from(&field.directives)).unwrap()
    }

    #[test]
    fn constant_conditions() {
        assert!(field_conditions("{ a }").is_true());
        assert_eq!(
            field_conditions("{ a @skip(if: true) }"),
            Conditions::Boolean(false)
        );
        assert!(field_conditions("{ a @include(if: true) }").is_true());
    }

    #[test]
    fn variable_conditions_merge() {
        let included = field_conditions("query($v: Boolean!) { a @include(if: $v) }");
        assert_eq!(included.to_string(), "$v");
        let skipped = field_conditions("query($v: Boolean!) { a @skip(if: $v) }");
        assert_eq!(skipped.to_string(), "!$v");
        assert_eq!(included.clone().merge(skipped), Conditions::Boolean(false));
        assert_eq!(
            included.clone().merge(Conditions::Boolean(true)),
            included
        );
    }
}
