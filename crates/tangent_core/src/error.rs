/// Errors raised by integrator engines, augmentation, and derivative functions.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IntegratorError {
    /// Invalid or inconsistent dimensions, or an invalid horizon. Raised by `init()`.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A capability the call needs is missing (backward system, derivatives, sparsity).
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The backend could not advance the trajectory.
    #[error("integration failed at t = {t}: {reason}")]
    Integration { t: f64, reason: String },

    /// Out-of-order call or malformed argument.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl IntegratorError {
    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub(crate) fn integration(t: f64, reason: impl Into<String>) -> Self {
        Self::Integration {
            t,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }
}

pub type Result<T, E = IntegratorError> = std::result::Result<T, E>;
