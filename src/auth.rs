/// Credential handoff between [`RegisterStep`](crate::steps::register::RegisterStep) and
/// [`StatusStep`](crate::steps::status::StatusStep).
///
/// Owned exclusively by the driver and passed by reference into whichever step is
/// currently running; the driver never runs two steps concurrently, so there is no need
/// for the steps themselves to synchronize on it beyond the `Mutex` the driver wraps it in.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationCtx {
    pub sas_token: Option<String>,
    pub derived_key: Option<Vec<u8>>,
}

impl AuthorizationCtx {
    pub fn new() -> Self {
        Self::default()
    }
}
