use async_trait::async_trait;

use crate::error::DpsmError;

/// Which attestation mechanism a [`SecurityProvider`] implements. The driver consults this
/// to decide whether `RequestData::is_x509` is set and whether a TPM key must be activated
/// on `ASSIGNED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityProviderKind {
    X509,
    Tpm,
    SymmetricKey,
}

/// The device-side identity and key material the driver needs to open a transport and sign
/// registration requests. Key material, TPM operations, and X.509 chains themselves are out
/// of scope here; the driver only calls through this contract.
#[async_trait]
pub trait SecurityProvider: Send + Sync {
    fn registration_id(&self) -> String;
    fn ssl_context(&self) -> Vec<u8>;
    fn kind(&self) -> SecurityProviderKind;

    /// Inject the service-issued activation key. Only ever called when `kind() == Tpm`,
    /// exactly once, strictly after `ASSIGNED` validation and before the registration
    /// callback fires. The default implementation is unreachable for non-TPM providers.
    async fn activate_identity_key(&self, _key: &[u8]) -> Result<(), DpsmError> {
        unreachable!("activate_identity_key is only called for a TPM security provider")
    }
}
