use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::DpsmError;

/// Wire status reported by the Device Provisioning Service. Parsing is case-insensitive
/// because the service does not guarantee a fixed casing across transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningStatus {
    Unassigned,
    Assigning,
    Assigned,
    Failed,
    Disabled,
}

impl ProvisioningStatus {
    /// Whether this status ends the poll loop.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProvisioningStatus::Assigned | ProvisioningStatus::Failed | ProvisioningStatus::Disabled
        )
    }

    pub(crate) fn parse(raw: &str) -> Result<Self, DpsmError> {
        if raw.eq_ignore_ascii_case("unassigned") {
            Ok(ProvisioningStatus::Unassigned)
        } else if raw.eq_ignore_ascii_case("assigning") {
            Ok(ProvisioningStatus::Assigning)
        } else if raw.eq_ignore_ascii_case("assigned") {
            Ok(ProvisioningStatus::Assigned)
        } else if raw.eq_ignore_ascii_case("failed") {
            Ok(ProvisioningStatus::Failed)
        } else if raw.eq_ignore_ascii_case("disabled") {
            Ok(ProvisioningStatus::Disabled)
        } else {
            Err(DpsmError::authentication_failure(format!(
                "invalid provisioning status '{raw}'"
            )))
        }
    }
}

/// Coarse, driver-internal state surfaced to the embedder alongside a [`RegistrationResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    Unauthenticated,
    Authenticated,
    Assigning,
    Assigned,
    Failed,
    Disabled,
    Error,
}

/// The response body of a Register or Status call, as parsed by a [`RegisterStep`](crate::steps::register::RegisterStep)
/// or [`StatusStep`](crate::steps::status::StatusStep). The core is oblivious to whether the
/// underlying envelope was JSON, CBOR, or anything else -- it only needs this shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationOperationStatus {
    pub operation_id: Option<String>,
    status: Option<String>,
    pub registration_state: Option<RegistrationState>,
}

impl RegistrationOperationStatus {
    /// Parses the raw wire status. `Ok(None)` means the field was absent; `Err` means it
    /// was present but unrecognized -- both are `AuthenticationFailure`s to the caller, but
    /// kept distinct here so a parse failure can carry the offending string.
    pub fn status(&self) -> Result<Option<ProvisioningStatus>, DpsmError> {
        self.status.as_deref().map(ProvisioningStatus::parse).transpose()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationState {
    pub registration_id: Option<String>,
    pub assigned_hub: Option<String>,
    pub device_id: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    pub substatus: Option<String>,
    pub created_date_time_utc: Option<DateTime<Utc>>,
    pub last_updates_date_time_utc: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub error_message: Option<String>,
    pub error_code: Option<i32>,
    #[serde(default)]
    pub tpm: Option<TpmRegistrationState>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TpmRegistrationState {
    pub authentication_key: Option<String>,
}

/// What the embedder receives from [`Dpsm::run`](crate::driver::Dpsm::run) through the
/// registration callback. For non-assigned terminals `assigned_hub`/`device_id`/`payload`
/// are `None` and `lifecycle_status` encodes the reason.
#[derive(Debug, Clone)]
pub struct RegistrationResult {
    pub assigned_hub: Option<String>,
    pub device_id: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub lifecycle_status: LifecycleStatus,
    pub registration_id: Option<String>,
    pub substatus: Option<String>,
    pub created_date_time_utc: Option<DateTime<Utc>>,
    pub last_updates_date_time_utc: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

impl RegistrationResult {
    pub(crate) fn failed(lifecycle_status: LifecycleStatus, state: Option<&RegistrationState>) -> Self {
        RegistrationResult {
            assigned_hub: None,
            device_id: None,
            payload: None,
            lifecycle_status,
            registration_id: state.and_then(|s| s.registration_id.clone()),
            substatus: state.and_then(|s| s.substatus.clone()),
            created_date_time_utc: state.and_then(|s| s.created_date_time_utc),
            last_updates_date_time_utc: state.and_then(|s| s.last_updates_date_time_utc),
            etag: state.and_then(|s| s.etag.clone()),
        }
    }

    pub(crate) fn assigned(state: &RegistrationState) -> Result<Self, DpsmError> {
        let assigned_hub = state
            .assigned_hub
            .clone()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DpsmError::authentication_failure("assigned_hub missing or empty on ASSIGNED"))?;
        let device_id = state
            .device_id
            .clone()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| DpsmError::authentication_failure("device_id missing or empty on ASSIGNED"))?;

        Ok(RegistrationResult {
            assigned_hub: Some(assigned_hub),
            device_id: Some(device_id),
            payload: state.payload.clone(),
            lifecycle_status: LifecycleStatus::Assigned,
            registration_id: state.registration_id.clone(),
            substatus: state.substatus.clone(),
            created_date_time_utc: state.created_date_time_utc,
            last_updates_date_time_utc: state.last_updates_date_time_utc,
            etag: state.etag.clone(),
        })
    }
}
