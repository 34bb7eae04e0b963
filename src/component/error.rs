//! Domain errors for the component/trait/command model.
//!
//! These are bounded refusal states, not library failures: every variant
//! maps to a stable wire code that travels in command error payloads.

use thiserror::Error;

use crate::error::Transience;

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum DomainError {
    #[error("invalid json: {0}")]
    InvalidJson(String),

    #[error("`{context}` must be a JSON object")]
    ObjectExpected { context: String },

    #[error("{message}")]
    PropertyMissing { message: String },

    #[error("{message}")]
    InvalidPropValue { message: String },

    #[error("{message}")]
    TypeMismatch { message: String },

    #[error("{message}")]
    InvalidState { message: String },

    #[error("unknown command `{name}`")]
    InvalidCommandName { name: String },

    #[error("command has been destroyed")]
    CommandDestroyed,

    #[error("{message}")]
    CommandFailed { message: String },

    #[error("user role `{role}` is less than minimal `{required}`")]
    AccessDenied { role: String, required: String },

    #[error("component `{component}` does not support trait `{trait_name}`")]
    TraitNotSupported {
        component: String,
        trait_name: String,
    },

    #[error("no component supports trait `{trait_name}` for command `{name}`")]
    UnroutedCommand { name: String, trait_name: String },
}

impl DomainError {
    /// Stable wire code, used in command error payloads and cloud
    /// patches.
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::InvalidJson(_) => "invalid_json",
            DomainError::ObjectExpected { .. } => "object_expected",
            DomainError::PropertyMissing { .. } => "property_missing",
            DomainError::InvalidPropValue { .. } => "invalid_prop_value",
            DomainError::TypeMismatch { .. } => "type_mismatch",
            DomainError::InvalidState { .. } => "invalid_state",
            DomainError::InvalidCommandName { .. } => "invalid_command_name",
            DomainError::CommandDestroyed => "command_destroyed",
            DomainError::CommandFailed { .. } => "command_failed",
            DomainError::AccessDenied { .. } => "access_denied",
            DomainError::TraitNotSupported { .. } => "trait_not_supported",
            DomainError::UnroutedCommand { .. } => "unrouted_command",
        }
    }

    pub fn transience(&self) -> Transience {
        // Domain refusals never succeed on retry with the same inputs.
        Transience::Permanent
    }

    pub(crate) fn property_missing(message: impl Into<String>) -> Self {
        DomainError::PropertyMissing {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_prop_value(message: impl Into<String>) -> Self {
        DomainError::InvalidPropValue {
            message: message.into(),
        }
    }

    pub(crate) fn type_mismatch(message: impl Into<String>) -> Self {
        DomainError::TypeMismatch {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        DomainError::InvalidState {
            message: message.into(),
        }
    }
}
