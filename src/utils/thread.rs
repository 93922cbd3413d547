//! Run-identity tag used for every log line a provisioning run emits.
//!
//! Renaming the OS thread that runs the provisioning task to
//! `"<hostname>-<uniqueId>-Cxn<connectionId>-azure-iot-sdk-ProvisioningTask"` is a natural
//! move for a blocking worker thread, but a `tokio` task has no OS thread of its own to
//! rename -- the same poll can hop between worker threads between `.await` points. This
//! module exposes the identical descriptor as a structured tag attached to every log line
//! instead.

const PENDING_CONNECTION_ID: &str = "PendingConnectionId";

/// Builds the `"<hostname>-<uniqueId>-Cxn<connectionId>-azure-iot-sdk-ProvisioningTask"`
/// descriptor for a run. Before `open()` succeeds, `connection_id` should be
/// [`PENDING_CONNECTION_ID`].
pub(crate) fn run_tag(unique_id: &str, connection_id: &str) -> String {
    let hostname = hostname();
    format!("{hostname}-{unique_id}-Cxn{connection_id}-azure-iot-sdk-ProvisioningTask")
}

pub(crate) fn pending_connection_tag(unique_id: &str) -> String {
    run_tag(unique_id, PENDING_CONNECTION_ID)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_tag_uses_literal_connection_id() {
        let tag = pending_connection_tag("dev-1");
        assert!(tag.contains("-dev-1-CxnPendingConnectionId-azure-iot-sdk-ProvisioningTask"));
    }

    #[test]
    fn run_tag_embeds_connection_id() {
        let tag = run_tag("dev-1", "42");
        assert!(tag.ends_with("-dev-1-Cxn42-azure-iot-sdk-ProvisioningTask"));
    }
}
