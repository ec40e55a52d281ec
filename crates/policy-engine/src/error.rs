use std::fmt;

use crate::schema::EventSource;

/// Reasons a [`Policy`](crate::Policy) cannot be turned into a
/// [`CompiledPolicy`](crate::CompiledPolicy).
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("policy id must not be empty")]
    EmptyId,

    #[error("policy '{0}' has no name")]
    EmptyName(String),

    #[error("policy '{0}' has no policy sections")]
    NoSections(String),

    #[error("section {section} of policy '{policy_id}' has no policy groups")]
    EmptySection { policy_id: String, section: usize },

    #[error("runtime policy '{0}' must set event_source to DEPLOYMENT_EVENT or NODE_EVENT")]
    RuntimeWithoutEventSource(String),

    #[error("unknown field name '{0}'")]
    UnknownField(String),

    #[error("field '{field}' cannot be used in a policy with event source {event_source}")]
    UnsupportedField {
        field: &'static str,
        event_source: EventSource,
    },

    #[error("invalid value '{value}' for field '{field}': {reason}")]
    InvalidValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid regex '{value}' for field '{field}': {source}")]
    InvalidRegex {
        field: &'static str,
        value: String,
        source: regex::Error,
    },

    #[error("invalid path pattern '{value}' for field '{field}': {source}")]
    InvalidGlob {
        field: &'static str,
        value: String,
        source: globset::Error,
    },

    #[error("field '{0}' does not support an operation restriction")]
    OperationsNotSupported(&'static str),

    #[error("scope entry {index} is invalid: {reason}")]
    InvalidScope { index: usize, reason: String },

    #[error("scope entry {index} uses a {kind} label but no {kind} label provider was supplied")]
    MissingLabelProvider { index: usize, kind: &'static str },

    #[error("exclusion '{name}' is invalid: {source}")]
    InvalidExclusion {
        name: String,
        #[source]
        source: Box<CompileError>,
    },
}

/// Failures while matching an event against a compiled policy.
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("failed to look up {kind} labels for '{id}': {source}")]
    LabelLookup {
        kind: &'static str,
        id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("evaluation of policy '{policy_id}' panicked: {message}")]
    MatcherPanicked { policy_id: String, message: String },
}

/// Errors returned by [`PolicySet`](crate::PolicySet) operations.
#[derive(Debug, thiserror::Error)]
pub enum PolicySetError {
    #[error("policy with ID not found in set: {0}")]
    NotFound(String),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Callback(#[from] anyhow::Error),
}

/// Collects several errors under one label and turns them into a single
/// error value at the end of a pass.
#[derive(Debug)]
pub struct ErrorList {
    context: String,
    errors: Vec<anyhow::Error>,
}

impl ErrorList {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            errors: Vec::new(),
        }
    }

    pub fn push(&mut self, err: impl Into<anyhow::Error>) {
        self.errors.push(err.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// `Ok(())` if nothing was collected, otherwise the list itself.
    pub fn into_result(self) -> Result<(), ErrorList> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors: [", self.context)?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{err:#}")?;
        }
        f.write_str("]")
    }
}

impl std::error::Error for ErrorList {}
