use thiserror::Error;

/// The closed set of ways a provisioning run can fail.
///
/// Every variant other than [`DpsmError::InvalidArgument`] is delivered to the
/// caller's [`RegistrationCallback`](crate::callback::RegistrationCallback) rather than
/// returned from [`Dpsm::run`](crate::driver::Dpsm::run); `InvalidArgument` is the only
/// error that can occur before a run begins.
#[derive(Debug, Error)]
pub enum DpsmError {
    /// The driver was constructed without a transport, config, security provider, or
    /// registration callback.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A registration or status response was missing, unparseable, or missing a
    /// required field (operation id, status, or the hub/device/TPM key expected on
    /// `ASSIGNED`).
    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    /// The service reported a terminal `FAILED` or `DISABLED` status.
    #[error("hub rejected the registration: {message}{}", error_code_suffix(*error_code))]
    HubException {
        message: String,
        error_code: Option<i32>,
    },

    /// The transport contract (`open`/`close`/request) returned an error.
    #[error("transport error: {0}")]
    TransportError(#[source] anyhow::Error),

    /// The security provider returned an error, e.g. during TPM key activation.
    #[error("security provider error: {0}")]
    SecurityProviderError(#[source] anyhow::Error),

    /// A step (Register or Status) did not complete within its deadline.
    #[error("{step} timed out after {elapsed_ms} ms")]
    Timeout { step: &'static str, elapsed_ms: u64 },
}

fn error_code_suffix(code: Option<i32>) -> String {
    match code {
        Some(code) => format!(" (error code {code})"),
        None => String::new(),
    }
}

impl DpsmError {
    pub(crate) fn invalid_argument(what: &str) -> Self {
        DpsmError::InvalidArgument(what.to_string())
    }

    pub(crate) fn authentication_failure(what: impl Into<String>) -> Self {
        DpsmError::AuthenticationFailure(what.into())
    }
}
