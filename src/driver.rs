use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::Mutex;

use crate::auth::AuthorizationCtx;
use crate::callback::{DpsmConfig, RegistrationCallback};
use crate::error::DpsmError;
use crate::model::{LifecycleStatus, RegistrationOperationStatus, RegistrationResult, RegistrationState};
use crate::scheduler::StepScheduler;
use crate::security::{SecurityProvider, SecurityProviderKind};
use crate::steps::register::RegisterStep;
use crate::steps::status::StatusStep;
use crate::transport::{RequestData, TransportContract};
use crate::utils::thread;

const REGISTER_TIMEOUT: Duration = Duration::from_millis(1_000_000);
const STATUS_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Builds a [`Dpsm`], validating that the mandatory collaborators are present before any
/// I/O happens.
pub struct DpsmBuilder {
    transport: Option<Arc<dyn TransportContract>>,
    security_provider: Option<Arc<dyn SecurityProvider>>,
    callback: Option<Box<dyn RegistrationCallback>>,
    user_context: Option<Box<dyn Any + Send + Sync>>,
    payload: Option<Vec<u8>>,
    unique_identifier: Option<String>,
}

impl DpsmBuilder {
    pub fn new() -> Self {
        DpsmBuilder {
            transport: None,
            security_provider: None,
            callback: None,
            user_context: None,
            payload: None,
            unique_identifier: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn TransportContract>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_security_provider(mut self, provider: Arc<dyn SecurityProvider>) -> Self {
        self.security_provider = Some(provider);
        self
    }

    pub fn with_callback(mut self, callback: Box<dyn RegistrationCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_user_context(mut self, context: Box<dyn Any + Send + Sync>) -> Self {
        self.user_context = Some(context);
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_unique_identifier(mut self, unique_identifier: impl Into<String>) -> Self {
        self.unique_identifier = Some(unique_identifier.into());
        self
    }

    pub fn build(self) -> Result<Dpsm, DpsmError> {
        let transport = self
            .transport
            .ok_or_else(|| DpsmError::invalid_argument("transport is required"))?;
        let security_provider = self
            .security_provider
            .ok_or_else(|| DpsmError::invalid_argument("security provider is required"))?;
        let callback = self
            .callback
            .ok_or_else(|| DpsmError::invalid_argument("registration callback is required"))?;

        let config = DpsmConfig {
            security_provider,
            callback,
            user_context: self.user_context.unwrap_or_else(|| Box::new(())),
            payload: self.payload,
            unique_identifier: self.unique_identifier.unwrap_or_else(|| "dpsm".to_string()),
        };

        Ok(Dpsm {
            transport,
            config,
            scheduler: StepScheduler::new(),
        })
    }
}

impl Default for DpsmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The protocol-level orchestrator described in the design: open a transport, register,
/// poll until a terminal status, and deliver exactly one callback.
pub struct Dpsm {
    transport: Arc<dyn TransportContract>,
    config: DpsmConfig,
    scheduler: StepScheduler,
}

type StepOutcome<T> = Result<T, (RegistrationResult, DpsmError)>;

impl Dpsm {
    /// Runs the full state machine exactly once. The registration callback fires exactly
    /// once before this returns, whether the run ended in success, a service-reported
    /// failure/disablement, or an internal error. Calling `run` twice on the same `Dpsm`
    /// is not supported; `run` consumes `self` to make that statically impossible.
    pub async fn run(self) {
        let Dpsm {
            transport,
            config,
            scheduler,
        } = self;

        let pending_tag = thread::pending_connection_tag(&config.unique_identifier);
        log::info!("[{pending_tag}] starting provisioning run");

        let outcome = Self::run_inner(&transport, &config, &scheduler, &pending_tag).await;

        let (result, error) = match outcome {
            Ok(result) => (result, None),
            Err((result, error)) => (result, Some(error)),
        };

        match &error {
            None => log::info!("[{pending_tag}] provisioning run succeeded"),
            Some(e) => log::warn!("[{pending_tag}] provisioning run ended with error: {e}"),
        }

        config.callback.invoke(result, error, config.user_context.as_ref());

        log::debug!("[{pending_tag}] closing transport");
        transport.close().await;
    }

    async fn run_inner(
        transport: &Arc<dyn TransportContract>,
        config: &DpsmConfig,
        scheduler: &StepScheduler,
        pending_tag: &str,
    ) -> StepOutcome<RegistrationResult> {
        let registration_id = config.security_provider.registration_id();
        let is_x509 = config.security_provider.kind() == SecurityProviderKind::X509;
        let payload = config.payload.clone().unwrap_or_default();

        let request = RequestData {
            registration_id: registration_id.clone(),
            ssl_context: config.security_provider.ssl_context(),
            is_x509,
            payload: payload.clone(),
        };

        transport
            .open(request)
            .await
            .map_err(|e| (error_result(LifecycleStatus::Error, None), e))?;

        let run_tag = thread::run_tag(&config.unique_identifier, &registration_id);
        log::info!("[{run_tag}] transport opened (was [{pending_tag}])");

        let ctx = Arc::new(Mutex::new(AuthorizationCtx::new()));

        let register_step = RegisterStep::new(
            transport.clone(),
            config.security_provider.clone(),
            ctx.clone(),
            payload,
        );
        let op_status = scheduler
            .run("register", REGISTER_TIMEOUT, register_step.run())
            .await
            .map_err(|e| (error_result(LifecycleStatus::Error, None), e))?;

        let operation_id = op_status
            .operation_id
            .clone()
            .expect("RegisterStep validates operation_id is present");
        let mut current_status = op_status
            .status()
            .expect("RegisterStep validates the status parses")
            .expect("RegisterStep validates status is present");
        let mut last_state = op_status.registration_state.clone();

        while matches!(
            current_status,
            crate::model::ProvisioningStatus::Unassigned | crate::model::ProvisioningStatus::Assigning
        ) {
            let hint = transport.retry_hint();
            log::debug!("[{run_tag}] sleeping {:?} before next status poll", hint);
            if !hint.is_zero() {
                tokio::time::sleep(hint).await;
            }

            let status_step = StatusStep::new(transport.clone(), ctx.clone(), operation_id.clone());
            let op_status: RegistrationOperationStatus = scheduler
                .run("status", STATUS_TIMEOUT, status_step.run())
                .await
                .map_err(|e| (error_result(LifecycleStatus::Error, last_state.as_ref()), e))?;

            current_status = op_status
                .status()
                .map_err(|e| (error_result(LifecycleStatus::Error, last_state.as_ref()), e))?
                .expect("StatusStep validates status is present");
            last_state = op_status.registration_state.clone();
        }

        Self::terminal_dispatch(config, &run_tag, current_status, last_state).await
    }

    async fn terminal_dispatch(
        config: &DpsmConfig,
        run_tag: &str,
        status: crate::model::ProvisioningStatus,
        state: Option<RegistrationState>,
    ) -> StepOutcome<RegistrationResult> {
        use crate::model::ProvisioningStatus::*;

        match status {
            Assigned => {
                let state = state.ok_or_else(|| {
                    (
                        error_result(LifecycleStatus::Error, None),
                        DpsmError::authentication_failure("ASSIGNED status carried no registration state"),
                    )
                })?;

                let result = RegistrationResult::assigned(&state)
                    .map_err(|e| (error_result(LifecycleStatus::Error, Some(&state)), e))?;

                if config.security_provider.kind() == SecurityProviderKind::Tpm {
                    let key_b64 = state
                        .tpm
                        .as_ref()
                        .and_then(|t| t.authentication_key.as_deref())
                        .filter(|k| !k.is_empty())
                        .ok_or_else(|| {
                            (
                                error_result(LifecycleStatus::Error, Some(&state)),
                                DpsmError::authentication_failure(
                                    "TPM security provider requires a non-empty authentication key on ASSIGNED",
                                ),
                            )
                        })?;

                    let decoded = BASE64.decode(key_b64).map_err(|e| {
                        (
                            error_result(LifecycleStatus::Error, Some(&state)),
                            DpsmError::authentication_failure(format!("TPM authentication key is not valid base64: {e}")),
                        )
                    })?;

                    config
                        .security_provider
                        .activate_identity_key(&decoded)
                        .await
                        .map_err(|e| {
                            (
                                error_result(LifecycleStatus::Error, Some(&state)),
                                DpsmError::SecurityProviderError(e.into()),
                            )
                        })?;

                    log::info!("[{run_tag}] TPM identity key activated");
                }

                log::info!(
                    "[{run_tag}] assigned to hub {}",
                    result.assigned_hub.as_deref().unwrap_or_default()
                );
                Ok(result)
            }
            Failed => Err(Self::hub_exception(LifecycleStatus::Failed, state)),
            Disabled => Err(Self::hub_exception(LifecycleStatus::Disabled, state)),
            Unassigned | Assigning => unreachable!("poll loop only exits on a terminal status"),
        }
    }

    fn hub_exception(
        lifecycle: LifecycleStatus,
        state: Option<RegistrationState>,
    ) -> (RegistrationResult, DpsmError) {
        let message = state
            .as_ref()
            .and_then(|s| s.error_message.clone())
            .unwrap_or_else(|| "the service reported a terminal failure without a message".to_string());
        let error_code = state.as_ref().and_then(|s| s.error_code);

        let result = RegistrationResult::failed(lifecycle, state.as_ref());
        (result, DpsmError::HubException { message, error_code })
    }
}

fn error_result(lifecycle: LifecycleStatus, state: Option<&RegistrationState>) -> RegistrationResult {
    RegistrationResult::failed(lifecycle, state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockSecurityProvider, MockTransport, RecordingCallback};

    fn build(
        transport: MockTransport,
        security: MockSecurityProvider,
        callback: Arc<RecordingCallback>,
    ) -> Dpsm {
        DpsmBuilder::new()
            .with_transport(Arc::new(transport))
            .with_security_provider(Arc::new(security))
            .with_callback(Box::new(callback))
            .with_unique_identifier("test-device")
            .build()
            .unwrap()
    }

    #[test]
    fn build_fails_without_transport() {
        let err = DpsmBuilder::new()
            .with_security_provider(Arc::new(MockSecurityProvider::symmetric_key()))
            .with_callback(Box::new(Arc::new(RecordingCallback::new())))
            .build()
            .unwrap_err();
        assert!(matches!(err, DpsmError::InvalidArgument(_)));
    }

    #[test]
    fn build_fails_without_callback() {
        let err = DpsmBuilder::new()
            .with_transport(Arc::new(MockTransport::new()))
            .with_security_provider(Arc::new(MockSecurityProvider::symmetric_key()))
            .build()
            .unwrap_err();
        assert!(matches!(err, DpsmError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn happy_path_x509_does_not_activate_tpm_key() {
        let transport = Arc::new(
            MockTransport::new()
                .with_register_response(br#"{"operationId":"op-1","status":"assigning"}"#.to_vec())
                .with_status_responses(vec![
                    br#"{"status":"assigning"}"#.to_vec(),
                    br#"{"status":"assigned","registrationState":{"assignedHub":"h.example","deviceId":"d-42"}}"#
                        .to_vec(),
                ]),
        );
        let security = MockSecurityProvider::x509();
        let callback = Arc::new(RecordingCallback::new());

        let dpsm = DpsmBuilder::new()
            .with_transport(transport.clone())
            .with_security_provider(Arc::new(security))
            .with_callback(Box::new(callback.clone()))
            .with_unique_identifier("test-device")
            .build()
            .unwrap();

        dpsm.run().await;

        assert_eq!(callback.invocation_count(), 1);
        let (result, error) = callback.last();
        assert!(error.is_none());
        assert_eq!(result.assigned_hub.as_deref(), Some("h.example"));
        assert_eq!(result.device_id.as_deref(), Some("d-42"));
        assert_eq!(result.lifecycle_status, LifecycleStatus::Assigned);
        assert_eq!(transport.status_request_count(), 2, "both status polls should have been issued");
    }

    #[tokio::test]
    async fn happy_path_tpm_activates_key_before_callback() {
        let transport = MockTransport::new()
            .with_register_response(br#"{"operationId":"op-1","status":"assigning"}"#.to_vec())
            .with_status_responses(vec![br#"{
                "status":"assigned",
                "registrationState":{
                    "assignedHub":"h.example",
                    "deviceId":"d-42",
                    "tpm":{"authenticationKey":"c2VjcmV0"}
                }
            }"#
            .to_vec()]);
        let security = Arc::new(MockSecurityProvider::tpm());
        let callback = Arc::new(RecordingCallback::new());

        let dpsm = DpsmBuilder::new()
            .with_transport(Arc::new(transport))
            .with_security_provider(security.clone())
            .with_callback(Box::new(callback.clone()))
            .with_unique_identifier("test-device")
            .build()
            .unwrap();

        dpsm.run().await;

        assert_eq!(callback.invocation_count(), 1);
        let (result, error) = callback.last();
        assert!(error.is_none());
        assert_eq!(result.lifecycle_status, LifecycleStatus::Assigned);
        assert_eq!(security.activated_key(), Some(b"secret".to_vec()));
    }

    #[tokio::test]
    async fn tpm_activation_failure_surfaces_security_provider_error() {
        let transport = Arc::new(
            MockTransport::new()
                .with_register_response(br#"{"operationId":"op-1","status":"assigning"}"#.to_vec())
                .with_status_responses(vec![br#"{
                    "status":"assigned",
                    "registrationState":{
                        "assignedHub":"h.example",
                        "deviceId":"d-42",
                        "tpm":{"authenticationKey":"c2VjcmV0"}
                    }
                }"#
                .to_vec()]),
        );
        let security = Arc::new(MockSecurityProvider::tpm_with_activation_error());
        let callback = Arc::new(RecordingCallback::new());

        let dpsm = DpsmBuilder::new()
            .with_transport(transport.clone())
            .with_security_provider(security.clone())
            .with_callback(Box::new(callback.clone()))
            .with_unique_identifier("test-device")
            .build()
            .unwrap();

        dpsm.run().await;

        assert_eq!(callback.invocation_count(), 1);
        let (result, error) = callback.last();
        assert_eq!(result.lifecycle_status, LifecycleStatus::Error);
        assert!(matches!(error, Some(DpsmError::SecurityProviderError(_))));
        assert!(security.activated_key().is_none());
        assert!(transport.was_closed(), "transport must still be closed when activation fails");
    }

    #[tokio::test]
    async fn service_failure_surfaces_hub_exception() {
        let transport = MockTransport::new()
            .with_register_response(br#"{"operationId":"op-1","status":"assigning"}"#.to_vec())
            .with_status_responses(vec![
                br#"{"status":"failed","registrationState":{"errorMessage":"quota","errorCode":429001}}"#
                    .to_vec(),
            ]);
        let security = MockSecurityProvider::symmetric_key();
        let callback = Arc::new(RecordingCallback::new());
        let dpsm = build(transport, security, callback.clone());

        dpsm.run().await;

        let (result, error) = callback.last();
        assert_eq!(result.lifecycle_status, LifecycleStatus::Failed);
        assert!(result.assigned_hub.is_none());
        match error.unwrap() {
            DpsmError::HubException { message, error_code } => {
                assert_eq!(message, "quota");
                assert_eq!(error_code, Some(429001));
            }
            other => panic!("expected HubException, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disabled_enrollment_surfaces_hub_exception() {
        let transport = MockTransport::new()
            .with_register_response(br#"{"operationId":"op-1","status":"assigning"}"#.to_vec())
            .with_status_responses(vec![
                br#"{"status":"disabled","registrationState":{"errorMessage":"revoked"}}"#.to_vec(),
            ]);
        let security = MockSecurityProvider::symmetric_key();
        let callback = Arc::new(RecordingCallback::new());
        let dpsm = build(transport, security, callback.clone());

        dpsm.run().await;

        let (result, error) = callback.last();
        assert_eq!(result.lifecycle_status, LifecycleStatus::Disabled);
        match error.unwrap() {
            DpsmError::HubException { message, .. } => assert_eq!(message, "revoked"),
            other => panic!("expected HubException, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn assigned_without_hub_is_authentication_failure() {
        let transport = MockTransport::new()
            .with_register_response(br#"{"operationId":"op-1","status":"assigning"}"#.to_vec())
            .with_status_responses(vec![
                br#"{"status":"assigned","registrationState":{"assignedHub":"","deviceId":"d-42"}}"#
                    .to_vec(),
            ]);
        let security = Arc::new(MockSecurityProvider::tpm());
        let callback = Arc::new(RecordingCallback::new());

        let dpsm = DpsmBuilder::new()
            .with_transport(Arc::new(transport))
            .with_security_provider(security.clone())
            .with_callback(Box::new(callback.clone()))
            .with_unique_identifier("test-device")
            .build()
            .unwrap();

        dpsm.run().await;

        let (result, error) = callback.last();
        assert_eq!(result.lifecycle_status, LifecycleStatus::Error);
        assert!(matches!(error, Some(DpsmError::AuthenticationFailure(_))));
        assert!(security.activated_key().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn status_timeout_surfaces_as_error_and_closes_transport() {
        let transport = MockTransport::new()
            .with_register_response(br#"{"operationId":"op-1","status":"assigning"}"#.to_vec())
            .with_status_delay(Duration::from_millis(10_001))
            .with_status_responses(vec![
                br#"{"status":"assigned","registrationState":{"assignedHub":"h","deviceId":"d"}}"#.to_vec(),
            ]);
        let security = MockSecurityProvider::symmetric_key();
        let callback = Arc::new(RecordingCallback::new());
        let dpsm = build(transport, security, callback.clone());

        dpsm.run().await;

        let (result, error) = callback.last();
        assert_eq!(result.lifecycle_status, LifecycleStatus::Error);
        assert!(matches!(error, Some(DpsmError::Timeout { step: "status", .. })));
    }

    #[tokio::test]
    async fn transport_is_closed_exactly_once_on_success_and_on_error() {
        let transport = Arc::new(
            MockTransport::new()
                .with_register_response(br#"{"operationId":"op-1","status":"assigning"}"#.to_vec())
                .with_status_responses(vec![
                    br#"{"status":"assigned","registrationState":{"assignedHub":"h","deviceId":"d"}}"#.to_vec(),
                ]),
        );
        let callback = Arc::new(RecordingCallback::new());

        let dpsm = DpsmBuilder::new()
            .with_transport(transport.clone())
            .with_security_provider(Arc::new(MockSecurityProvider::symmetric_key()))
            .with_callback(Box::new(callback))
            .with_unique_identifier("test-device")
            .build()
            .unwrap();

        dpsm.run().await;

        assert_eq!(transport.close_count(), 1);
    }

    #[tokio::test]
    async fn open_failure_closes_transport_and_invokes_callback_once() {
        let transport = MockTransport::new().with_open_error(DpsmError::TransportError(anyhow::anyhow!("tls handshake failed")));
        let security = MockSecurityProvider::symmetric_key();
        let callback = Arc::new(RecordingCallback::new());
        let dpsm = build(transport, security, callback.clone());

        dpsm.run().await;

        assert_eq!(callback.invocation_count(), 1);
        let (result, error) = callback.last();
        assert_eq!(result.lifecycle_status, LifecycleStatus::Error);
        assert!(matches!(error, Some(DpsmError::TransportError(_))));
    }

    #[tokio::test]
    async fn status_polls_wait_for_transport_retry_hint() {
        let transport = MockTransport::new()
            .with_register_response(br#"{"operationId":"op-1","status":"assigning"}"#.to_vec())
            .with_retry_hint(Duration::from_millis(5))
            .with_status_responses(vec![
                br#"{"status":"assigning"}"#.to_vec(),
                br#"{"status":"assigned","registrationState":{"assignedHub":"h","deviceId":"d"}}"#.to_vec(),
            ]);
        let security = MockSecurityProvider::symmetric_key();
        let callback = Arc::new(RecordingCallback::new());
        let dpsm = build(transport, security, callback.clone());

        let start = tokio::time::Instant::now();
        dpsm.run().await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(10), "expected at least two retry-hint sleeps, elapsed {elapsed:?}");
        assert_eq!(callback.invocation_count(), 1);
    }

    #[tokio::test]
    async fn first_status_observes_ctx_written_by_register() {
        let transport = Arc::new(
            MockTransport::new()
                .with_register_response(br#"{"operationId":"op-1","status":"assigning"}"#.to_vec())
                .with_register_sas_token("sas-from-register")
                .with_status_responses(vec![
                    br#"{"status":"assigned","registrationState":{"assignedHub":"h","deviceId":"d"}}"#.to_vec(),
                ]),
        );
        let security = MockSecurityProvider::symmetric_key();
        let callback = Arc::new(RecordingCallback::new());

        let dpsm = DpsmBuilder::new()
            .with_transport(transport.clone())
            .with_security_provider(Arc::new(security))
            .with_callback(Box::new(callback))
            .with_unique_identifier("test-device")
            .build()
            .unwrap();

        dpsm.run().await;

        assert_eq!(
            transport.sas_token_seen_by_status().as_deref(),
            Some("sas-from-register"),
            "StatusStep must observe the AuthorizationCtx mutation RegisterStep made"
        );
    }
}
