//! Capabilities shared by every connector role.

use async_trait::async_trait;

use crate::protocol::{ConnectorSpecification, DatConnectionStatus, Status};

/// Identity and self-description of a connector.
pub trait Connector: Send + Sync {
    /// Registry identifier, lower-case (e.g. `"filesystem"`).
    fn name(&self) -> &str;

    /// The connector's specification: what it is and the settings its
    /// `connectionSpecification` accepts.
    fn spec(&self) -> ConnectorSpecification;
}

/// Connectivity check.
///
/// Implementors provide [`check_connection`](Checkable::check_connection);
/// callers use [`check`](Checkable::check), which turns every failure into a
/// `FAILED` status instead of an error.
#[async_trait]
pub trait Checkable: Send + Sync {
    /// `Ok((true, _))` if the connector can reach its backend with `config`.
    async fn check_connection(
        &self,
        config: &ConnectorSpecification,
    ) -> anyhow::Result<(bool, Option<String>)>;

    async fn check(&self, config: &ConnectorSpecification) -> DatConnectionStatus {
        match self.check_connection(config).await {
            Ok((true, message)) => DatConnectionStatus {
                status: Status::Succeeded,
                message,
            },
            Ok((false, message)) => DatConnectionStatus {
                status: Status::Failed,
                message,
            },
            Err(e) => {
                tracing::warn!(connector = %config.name, error = %e, "connection check failed");
                DatConnectionStatus {
                    status: Status::Failed,
                    message: Some(format!("{:#}", e)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flaky {
        fail_hard: bool,
    }

    #[async_trait]
    impl Checkable for Flaky {
        async fn check_connection(
            &self,
            _config: &ConnectorSpecification,
        ) -> anyhow::Result<(bool, Option<String>)> {
            if self.fail_hard {
                anyhow::bail!("connection refused");
            }
            Ok((false, Some("bad credentials".into())))
        }
    }

    fn config() -> ConnectorSpecification {
        ConnectorSpecification::new("flaky", serde_json::json!({}))
    }

    #[tokio::test]
    async fn errors_become_failed_status() {
        let status = Flaky { fail_hard: true }.check(&config()).await;
        assert_eq!(status.status, Status::Failed);
        assert_eq!(status.message.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn negative_check_keeps_message() {
        let status = Flaky { fail_hard: false }.check(&config()).await;
        assert_eq!(status.status, Status::Failed);
        assert_eq!(status.message.as_deref(), Some("bad credentials"));
    }
}
