use async_trait::async_trait;
use std::time::Duration;

use crate::auth::AuthorizationCtx;
use crate::error::DpsmError;

/// Everything handed to [`TransportContract::open`] to establish a session.
#[derive(Debug, Clone)]
pub struct RequestData {
    pub registration_id: String,
    pub ssl_context: Vec<u8>,
    pub is_x509: bool,
    pub payload: Vec<u8>,
}

/// The wire transport the driver drives through a single provisioning attempt.
///
/// Implementations carry the actual MQTT/AMQP/HTTP protocol and wire serialization; the
/// driver only knows this contract. `open`/`close`/the request methods may block on I/O,
/// so callers await them; `retry_hint` is synchronous because it is a pure, already-known
/// value (typically echoed back from the last response).
#[async_trait]
pub trait TransportContract: Send + Sync {
    /// Establish a session. Failure aborts the run.
    async fn open(&self, request: RequestData) -> Result<(), DpsmError>;

    /// Idempotent teardown. Must not error on a transport that was never opened.
    async fn close(&self);

    /// Service-suggested inter-poll delay, consulted before every status attempt
    /// (including the first).
    fn retry_hint(&self) -> Duration;

    /// Submit the registration request and return the raw response bytes to parse.
    async fn register_request(
        &self,
        ctx: &mut AuthorizationCtx,
        payload: &[u8],
    ) -> Result<Vec<u8>, DpsmError>;

    /// Submit a status query for `operation_id` and return the raw response bytes to parse.
    async fn status_request(
        &self,
        ctx: &mut AuthorizationCtx,
        operation_id: &str,
    ) -> Result<Vec<u8>, DpsmError>;
}
