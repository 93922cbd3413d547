use std::sync::Arc;

use tokio::sync::Mutex;

use crate::auth::AuthorizationCtx;
use crate::error::DpsmError;
use crate::model::RegistrationOperationStatus;
use crate::security::SecurityProvider;
use crate::transport::TransportContract;

/// One-shot: send the registration request and parse the resulting
/// [`RegistrationOperationStatus`]. Does not retry -- retry is a driver policy (see the
/// poll loop in [`Dpsm::run`](crate::driver::Dpsm::run)).
pub(crate) struct RegisterStep {
    transport: Arc<dyn TransportContract>,
    #[allow(dead_code)]
    security_provider: Arc<dyn SecurityProvider>,
    ctx: Arc<Mutex<AuthorizationCtx>>,
    payload: Vec<u8>,
}

impl RegisterStep {
    pub(crate) fn new(
        transport: Arc<dyn TransportContract>,
        security_provider: Arc<dyn SecurityProvider>,
        ctx: Arc<Mutex<AuthorizationCtx>>,
        payload: Vec<u8>,
    ) -> Self {
        RegisterStep {
            transport,
            security_provider,
            ctx,
            payload,
        }
    }

    pub(crate) async fn run(self) -> Result<RegistrationOperationStatus, DpsmError> {
        log::debug!("Submitting registration request");
        let response = {
            let mut ctx = self.ctx.lock().await;
            self.transport
                .register_request(&mut ctx, &self.payload)
                .await?
        };

        let status: RegistrationOperationStatus = serde_json::from_slice(&response)
            .map_err(|e| DpsmError::authentication_failure(format!("invalid registration response: {e}")))?;

        if status.operation_id.as_deref().unwrap_or_default().is_empty() {
            return Err(DpsmError::authentication_failure(
                "registration response is missing an operation id",
            ));
        }
        if status.status()?.is_none() {
            return Err(DpsmError::authentication_failure(
                "registration response is missing a status",
            ));
        }

        log::debug!(
            "Registration accepted, operation id {}",
            status.operation_id.as_deref().unwrap_or_default()
        );

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockSecurityProvider, MockTransport};

    #[tokio::test]
    async fn fails_when_operation_id_missing() {
        let transport = Arc::new(MockTransport::new().with_register_response(br#"{"status":"assigning"}"#.to_vec()));
        let security = Arc::new(MockSecurityProvider::symmetric_key());
        let step = RegisterStep::new(
            transport,
            security,
            Arc::new(Mutex::new(AuthorizationCtx::new())),
            Vec::new(),
        );

        let err = step.run().await.unwrap_err();
        assert!(matches!(err, DpsmError::AuthenticationFailure(_)));
    }

    #[tokio::test]
    async fn parses_operation_id_and_status() {
        let transport = Arc::new(
            MockTransport::new()
                .with_register_response(br#"{"operationId":"op-1","status":"assigning"}"#.to_vec()),
        );
        let security = Arc::new(MockSecurityProvider::symmetric_key());
        let step = RegisterStep::new(
            transport,
            security,
            Arc::new(Mutex::new(AuthorizationCtx::new())),
            Vec::new(),
        );

        let status = step.run().await.unwrap();
        assert_eq!(status.operation_id.as_deref(), Some("op-1"));
    }

    #[tokio::test]
    async fn surfaces_transport_error() {
        let transport = Arc::new(MockTransport::new().with_register_error(DpsmError::TransportError(
            anyhow::anyhow!("connection reset"),
        )));
        let security = Arc::new(MockSecurityProvider::symmetric_key());
        let step = RegisterStep::new(
            transport,
            security,
            Arc::new(Mutex::new(AuthorizationCtx::new())),
            Vec::new(),
        );

        let err = step.run().await.unwrap_err();
        assert!(matches!(err, DpsmError::TransportError(_)));
    }
}
