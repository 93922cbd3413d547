use std::any::Any;
use std::sync::Arc;

use crate::error::DpsmError;
use crate::model::RegistrationResult;
use crate::security::SecurityProvider;

/// Invoked exactly once per [`Dpsm::run`](crate::driver::Dpsm::run), whether the run ended
/// in success, a service-reported failure, disablement, or an internal error.
pub trait RegistrationCallback: Send + Sync {
    fn invoke(
        &self,
        result: RegistrationResult,
        error: Option<DpsmError>,
        user_context: &(dyn Any + Send + Sync),
    );
}

impl<F> RegistrationCallback for F
where
    F: Fn(RegistrationResult, Option<DpsmError>, &(dyn Any + Send + Sync)) + Send + Sync,
{
    fn invoke(
        &self,
        result: RegistrationResult,
        error: Option<DpsmError>,
        user_context: &(dyn Any + Send + Sync),
    ) {
        self(result, error, user_context)
    }
}

impl<T: RegistrationCallback + ?Sized> RegistrationCallback for Arc<T> {
    fn invoke(
        &self,
        result: RegistrationResult,
        error: Option<DpsmError>,
        user_context: &(dyn Any + Send + Sync),
    ) {
        T::invoke(self, result, error, user_context)
    }
}

/// Configuration for a single [`Dpsm::run`](crate::driver::Dpsm::run) invocation.
///
/// Every field is mandatory in the sense described in §4.1 of the design: a missing
/// `security_provider` or `callback` fails construction with
/// [`DpsmError::InvalidArgument`](crate::error::DpsmError::InvalidArgument) rather than
/// surfacing later.
pub struct DpsmConfig {
    pub security_provider: Arc<dyn SecurityProvider>,
    pub callback: Box<dyn RegistrationCallback>,
    pub user_context: Box<dyn Any + Send + Sync>,
    pub payload: Option<Vec<u8>>,
    pub unique_identifier: String,
}
