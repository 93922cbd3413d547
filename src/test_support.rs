//! Test doubles shared by the unit tests in [`crate::steps`], [`crate::driver`], and
//! this module's own tests. Not part of the public API.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::auth::AuthorizationCtx;
use crate::error::DpsmError;
use crate::security::{SecurityProvider, SecurityProviderKind};
use crate::transport::{RequestData, TransportContract};

/// A [`TransportContract`] double that serves canned responses from a queue and records
/// what it was asked to do, for tests that assert on driver/step behavior without any
/// real network I/O.
pub(crate) struct MockTransport {
    register_response: StdMutex<Option<Result<Vec<u8>, DpsmError>>>,
    register_sas_token: Option<String>,
    status_responses: StdMutex<Vec<Result<Vec<u8>, DpsmError>>>,
    retry_hint: Duration,
    status_delay: Duration,
    open_result: StdMutex<Option<Result<(), DpsmError>>>,
    opened: StdMutex<bool>,
    closed: StdMutex<bool>,
    close_count: StdMutex<u32>,
    status_request_count: StdMutex<u32>,
    sas_token_seen_by_status: StdMutex<Option<String>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        MockTransport {
            register_response: StdMutex::new(None),
            register_sas_token: None,
            status_responses: StdMutex::new(Vec::new()),
            retry_hint: Duration::from_millis(0),
            status_delay: Duration::from_millis(0),
            open_result: StdMutex::new(Some(Ok(()))),
            opened: StdMutex::new(false),
            closed: StdMutex::new(false),
            close_count: StdMutex::new(0),
            status_request_count: StdMutex::new(0),
            sas_token_seen_by_status: StdMutex::new(None),
        }
    }

    pub(crate) fn with_register_response(self, bytes: Vec<u8>) -> Self {
        *self.register_response.lock().unwrap() = Some(Ok(bytes));
        self
    }

    pub(crate) fn with_register_error(self, err: DpsmError) -> Self {
        *self.register_response.lock().unwrap() = Some(Err(err));
        self
    }

    pub(crate) fn with_status_responses(self, responses: Vec<Vec<u8>>) -> Self {
        *self.status_responses.lock().unwrap() = responses.into_iter().map(Ok).collect();
        self
    }

    pub(crate) fn with_retry_hint(mut self, hint: Duration) -> Self {
        self.retry_hint = hint;
        self
    }

    pub(crate) fn with_status_delay(mut self, delay: Duration) -> Self {
        self.status_delay = delay;
        self
    }

    pub(crate) fn with_open_error(self, err: DpsmError) -> Self {
        *self.open_result.lock().unwrap() = Some(Err(err));
        self
    }

    /// `register_request` will write this value into `ctx.sas_token`, so a test can later
    /// assert `status_request` observed it (the Register→Status `AuthorizationCtx`
    /// handoff, §8 property 6).
    pub(crate) fn with_register_sas_token(mut self, token: impl Into<String>) -> Self {
        self.register_sas_token = Some(token.into());
        self
    }

    pub(crate) fn was_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    pub(crate) fn close_count(&self) -> u32 {
        *self.close_count.lock().unwrap()
    }

    pub(crate) fn status_request_count(&self) -> u32 {
        *self.status_request_count.lock().unwrap()
    }

    /// The value of `ctx.sas_token` as observed by the most recent `status_request` call.
    pub(crate) fn sas_token_seen_by_status(&self) -> Option<String> {
        self.sas_token_seen_by_status.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportContract for MockTransport {
    async fn open(&self, _request: RequestData) -> Result<(), DpsmError> {
        *self.opened.lock().unwrap() = true;
        match self.open_result.lock().unwrap().take() {
            Some(result) => result,
            None => Ok(()),
        }
    }

    async fn close(&self) {
        *self.closed.lock().unwrap() = true;
        *self.close_count.lock().unwrap() += 1;
    }

    fn retry_hint(&self) -> Duration {
        self.retry_hint
    }

    async fn register_request(
        &self,
        ctx: &mut AuthorizationCtx,
        _payload: &[u8],
    ) -> Result<Vec<u8>, DpsmError> {
        if let Some(token) = &self.register_sas_token {
            ctx.sas_token = Some(token.clone());
        }
        self.register_response
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(DpsmError::authentication_failure("no register response queued")))
    }

    async fn status_request(
        &self,
        ctx: &mut AuthorizationCtx,
        _operation_id: &str,
    ) -> Result<Vec<u8>, DpsmError> {
        *self.status_request_count.lock().unwrap() += 1;
        *self.sas_token_seen_by_status.lock().unwrap() = ctx.sas_token.clone();
        if !self.status_delay.is_zero() {
            tokio::time::sleep(self.status_delay).await;
        }
        let mut responses = self.status_responses.lock().unwrap();
        if responses.is_empty() {
            Err(DpsmError::authentication_failure("no status response queued"))
        } else {
            responses.remove(0)
        }
    }
}

/// A [`SecurityProvider`] double covering all three attestation kinds.
pub(crate) struct MockSecurityProvider {
    registration_id: String,
    kind: SecurityProviderKind,
    activated_key: StdMutex<Option<Vec<u8>>>,
    activation_error: bool,
}

impl MockSecurityProvider {
    pub(crate) fn symmetric_key() -> Self {
        MockSecurityProvider {
            registration_id: "mock-registration-id".to_string(),
            kind: SecurityProviderKind::SymmetricKey,
            activated_key: StdMutex::new(None),
            activation_error: false,
        }
    }

    pub(crate) fn x509() -> Self {
        MockSecurityProvider {
            kind: SecurityProviderKind::X509,
            ..Self::symmetric_key()
        }
    }

    pub(crate) fn tpm() -> Self {
        MockSecurityProvider {
            kind: SecurityProviderKind::Tpm,
            ..Self::symmetric_key()
        }
    }

    pub(crate) fn tpm_with_activation_error() -> Self {
        MockSecurityProvider {
            kind: SecurityProviderKind::Tpm,
            activation_error: true,
            ..Self::symmetric_key()
        }
    }

    pub(crate) fn activated_key(&self) -> Option<Vec<u8>> {
        self.activated_key.lock().unwrap().clone()
    }
}

#[async_trait]
impl SecurityProvider for MockSecurityProvider {
    fn registration_id(&self) -> String {
        self.registration_id.clone()
    }

    fn ssl_context(&self) -> Vec<u8> {
        Vec::new()
    }

    fn kind(&self) -> SecurityProviderKind {
        self.kind
    }

    async fn activate_identity_key(&self, key: &[u8]) -> Result<(), DpsmError> {
        if self.activation_error {
            return Err(DpsmError::SecurityProviderError(anyhow::anyhow!(
                "mock TPM activation failure"
            )));
        }
        *self.activated_key.lock().unwrap() = Some(key.to_vec());
        Ok(())
    }
}

/// A [`crate::callback::RegistrationCallback`] double that records every invocation, for
/// asserting the "exactly once" contract described in §4.1/§8 of the design.
pub(crate) struct RecordingCallback {
    invocations: StdMutex<Vec<(crate::model::RegistrationResult, Option<DpsmError>)>>,
}

impl RecordingCallback {
    pub(crate) fn new() -> Self {
        RecordingCallback {
            invocations: StdMutex::new(Vec::new()),
        }
    }

    pub(crate) fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    pub(crate) fn last(&self) -> (crate::model::RegistrationResult, Option<DpsmError>) {
        let mut invocations = self.invocations.lock().unwrap();
        invocations.pop().expect("callback was never invoked")
    }
}

impl crate::callback::RegistrationCallback for RecordingCallback {
    fn invoke(
        &self,
        result: crate::model::RegistrationResult,
        error: Option<DpsmError>,
        _user_context: &(dyn std::any::Any + Send + Sync),
    ) {
        self.invocations.lock().unwrap().push((result, error));
    }
}
