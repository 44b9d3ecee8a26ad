use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Write;

use apollo_compiler::validation::DiagnosticList;
use apollo_compiler::validation::WithErrors;

/// Create an internal error.
///
/// # Example
/// ```rust
/// use apollo_query_graph::internal_error;
/// use apollo_query_graph::error::FederationError;
/// # fn may_be_none() -> Option<()> { None }
///
/// const NAME: &str = "the thing";
/// let result: Result<(), FederationError> = may_be_none()
///     .ok_or_else(|| internal_error!("Expected {NAME} to be Some"));
/// ```
#[macro_export]
macro_rules! internal_error {
    ( $( $arg:tt )+ ) => {
        $crate::error::FederationError::internal(format!( $( $arg )+ ))
    }
}

/// Break out of the current function, returning an internal error.
///
/// # Example
/// ```rust
/// use apollo_query_graph::bail;
/// use apollo_query_graph::error::FederationError;
/// # fn may_be_none() -> Option<()> { None }
///
/// fn example() -> Result<(), FederationError> {
///     bail!("Something went horribly wrong");
///     unreachable!()
/// }
/// #
/// # _ = example();
/// ```
#[macro_export]
macro_rules! bail {
    ( $( $arg:tt )+ ) => {
        return Err($crate::internal_error!( $( $arg )+ ).into())
    }
}

/// A safe assertion: in debug mode, it panicks on failure, and in production, it returns an
/// internal error.
///
/// Treat this as an assertion. It must only be used for conditions that *should never happen*
/// in normal operation.
///
/// # Example
/// ```rust,no_run
/// use apollo_query_graph::ensure;
/// use apollo_query_graph::error::FederationError;
/// # fn may_be_none() -> Option<()> { None }
///
/// fn example() -> Result<(), FederationError> {
///     ensure!(1 == 0, "Something went horribly wrong");
///     unreachable!()
/// }
/// ```
#[macro_export]
macro_rules! ensure {
    ( $expr:expr, $( $arg:tt )+ ) => {
        #[cfg(debug_assertions)]
        {
            if false {
                return Err($crate::error::FederationError::internal("ensure!() must be used in a function that returns a Result").into());
            }
            assert!($expr, $( $arg )+);
        }

        #[cfg(not(debug_assertions))]
        if !$expr {
            $crate::bail!( $( $arg )+ );
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SingleFederationError {
    #[error(
        "An internal error has occurred, please report this bug to Apollo.\n\nDetails: {message}"
    )]
    Internal { message: String },
    #[error("{message}")]
    InvalidGraphQL { message: String },
    #[error("[{subgraph}] {message}")]
    InvalidSubgraph { subgraph: String, message: String },
    #[error("{message}")]
    QueryPlanComplexityExceeded { message: String },
    #[error("{message}")]
    NoPlanFound { message: String },
    #[error("Exceeded the limit of {limit} options for a single selection: {message}")]
    PathsLimitExceeded { limit: u32, message: String },
}

impl SingleFederationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Internal { .. } => "INTERNAL",
            Self::InvalidGraphQL { .. } => "INVALID_GRAPHQL",
            Self::InvalidSubgraph { .. } => "INVALID_SUBGRAPH",
            Self::QueryPlanComplexityExceeded { .. } => "QUERY_PLAN_COMPLEXITY_EXCEEDED",
            Self::NoPlanFound { .. } => "NO_PLAN_FOUND",
            Self::PathsLimitExceeded { .. } => "PATHS_LIMIT_EXCEEDED",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Default)]
pub struct MultipleFederationErrors {
    pub errors: Vec<SingleFederationError>,
}

impl MultipleFederationErrors {
    pub fn push(&mut self, error: FederationError) {
        match error {
            FederationError::SingleFederationError(error) => {
                self.errors.push(error);
            }
            FederationError::MultipleFederationErrors(errors) => {
                self.errors.extend(errors.errors);
            }
        }
    }

    pub(crate) fn into_result(self) -> Result<(), FederationError> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.into_iter().next().map_or_else(
                || FederationError::internal("Error list unexpectedly empty"),
                FederationError::from,
            )),
            _ => Err(self.into()),
        }
    }
}

impl Display for MultipleFederationErrors {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "The following errors occurred:")?;
        for error in &self.errors {
            write!(f, "\n\n  - ")?;
            for c in error.to_string().chars() {
                if c == '\n' {
                    write!(f, "\n    ")?;
                } else {
                    f.write_char(c)?;
                }
            }
        }
        Ok(())
    }
}

impl FromIterator<SingleFederationError> for MultipleFederationErrors {
    fn from_iter<T: IntoIterator<Item = SingleFederationError>>(iter: T) -> Self {
        Self {
            errors: iter.into_iter().collect(),
        }
    }
}

#[derive(Clone, thiserror::Error)]
pub enum FederationError {
    #[error(transparent)]
    SingleFederationError(#[from] SingleFederationError),
    #[error(transparent)]
    MultipleFederationErrors(#[from] MultipleFederationErrors),
}

impl std::fmt::Debug for FederationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SingleFederationError(inner) => std::fmt::Debug::fmt(inner, f),
            Self::MultipleFederationErrors(inner) => std::fmt::Debug::fmt(inner, f),
        }
    }
}

impl FederationError {
    pub fn internal(message: impl Into<String>) -> Self {
        SingleFederationError::Internal {
            message: message.into(),
        }
        .into()
    }

    pub fn errors(&self) -> Vec<&SingleFederationError> {
        match self {
            Self::SingleFederationError(error) => vec![error],
            Self::MultipleFederationErrors(errors) => errors.errors.iter().collect(),
        }
    }

    pub fn has_invalid_graphql_error(&self) -> bool {
        self.errors()
            .into_iter()
            .any(|error| matches!(error, SingleFederationError::InvalidGraphQL { .. }))
    }
}

impl From<DiagnosticList> for FederationError {
    fn from(value: DiagnosticList) -> Self {
        let errors: Vec<_> = value
            .iter()
            .map(|diagnostic| SingleFederationError::InvalidGraphQL {
                message: diagnostic.to_string(),
            })
            .collect();
        match errors.len().cmp(&1) {
            std::cmp::Ordering::Less => FederationError::internal("empty diagnostic list"),
            std::cmp::Ordering::Equal => errors
                .into_iter()
                .next()
                .map_or_else(|| FederationError::internal("empty diagnostic list"), Into::into),
            std::cmp::Ordering::Greater => MultipleFederationErrors { errors }.into(),
        }
    }
}

impl<T> From<WithErrors<T>> for FederationError {
    fn from(value: WithErrors<T>) -> Self {
        value.errors.into()
    }
}

impl From<std::fmt::Error> for FederationError {
    fn from(value: std::fmt::Error) -> Self {
        FederationError::internal(format!("Formatting failed: {value}"))
    }
}
