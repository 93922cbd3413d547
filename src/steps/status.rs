use std::sync::Arc;

use tokio::sync::Mutex;

use crate::auth::AuthorizationCtx;
use crate::error::DpsmError;
use crate::model::RegistrationOperationStatus;
use crate::transport::TransportContract;

/// One-shot: given an operation id, query the current status and parse the resulting
/// [`RegistrationOperationStatus`]. Authenticates using the [`AuthorizationCtx`] populated
/// by a prior [`RegisterStep`](crate::steps::register::RegisterStep). Does not retry.
pub(crate) struct StatusStep {
    transport: Arc<dyn TransportContract>,
    ctx: Arc<Mutex<AuthorizationCtx>>,
    operation_id: String,
}

impl StatusStep {
    pub(crate) fn new(
        transport: Arc<dyn TransportContract>,
        ctx: Arc<Mutex<AuthorizationCtx>>,
        operation_id: String,
    ) -> Self {
        StatusStep {
            transport,
            ctx,
            operation_id,
        }
    }

    pub(crate) async fn run(self) -> Result<RegistrationOperationStatus, DpsmError> {
        log::debug!("Querying registration status for operation {}", self.operation_id);
        let response = {
            let mut ctx = self.ctx.lock().await;
            self.transport
                .status_request(&mut ctx, &self.operation_id)
                .await?
        };

        let status: RegistrationOperationStatus = serde_json::from_slice(&response)
            .map_err(|e| DpsmError::authentication_failure(format!("invalid status response: {e}")))?;

        if status.status()?.is_none() {
            return Err(DpsmError::authentication_failure(
                "status response is missing a status",
            ));
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockTransport;

    #[tokio::test]
    async fn fails_on_unparseable_status() {
        let transport = Arc::new(MockTransport::new().with_status_responses(vec![br#"{"status":"bogus"}"#.to_vec()]));
        let step = StatusStep::new(
            transport,
            Arc::new(Mutex::new(AuthorizationCtx::new())),
            "op-1".to_string(),
        );

        let err = step.run().await.unwrap_err();
        assert!(matches!(err, DpsmError::AuthenticationFailure(_)));
    }
}
