use thiserror::Error;

/// Failures of the runtime around the pipeline rather than of a build step.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("builder misconfigured: {message}")]
    Configuration { message: String },
    /// The builder task panicked or was cancelled.
    #[error("builder task failed: {0}")]
    Task(String),
}

impl InfraError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    pub fn task(message: impl Into<String>) -> Self {
        Self::Task(message.into())
    }
}
