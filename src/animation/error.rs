use ulid::Ulid;

use super::template::TemplateId;

/// Result type alias for effect pool operations
pub type Result<T> = std::result::Result<T, EffectPoolError>;

/// Failures surfaced by the effect pool manager.
///
/// None of these are fatal: the manager stays usable after any of them.
#[derive(Debug, thiserror::Error)]
pub enum EffectPoolError {
    /// Spawn requested for a template the manager does not know
    #[error("Invalid template: {template}")]
    InvalidTemplate { template: TemplateId },

    /// Return for an instance/template pair that is not currently active
    #[error("Stale return: instance {instance} is not active for template {template}")]
    StaleReturn { template: TemplateId, instance: Ulid },

    /// The host could not realize a new instance of the template
    #[error("Failed to instantiate template {template} ({name})")]
    InstantiationFailed { template: TemplateId, name: String },

    /// The manager has been torn down
    #[error("Effect pool has been shut down")]
    ShutDown,

    #[error("Invalid config: {message}")]
    InvalidConfig { message: String },

    /// Template JSON could not be parsed
    #[error("Template format error: {0}")]
    TemplateFormat(#[from] serde_json::Error),
}
