use std::sync::Arc;

use chrono::{DateTime, Utc};

use tollgate_core::audit::{HistoryEvent, PiiHasher};
use tollgate_core::domain::history::ApprovalHistory;
use tollgate_db::repositories::{ApprovalHistoryRepository, RepositoryError};

/// Sole write path into `approval_history`. Actor IP and user agent are hashed here, before
/// the row reaches storage.
#[derive(Clone)]
pub struct AuditTrailRecorder {
    history: Arc<dyn ApprovalHistoryRepository>,
    hasher: PiiHasher,
}

impl AuditTrailRecorder {
    pub fn new(history: Arc<dyn ApprovalHistoryRepository>, hasher: PiiHasher) -> Self {
        Self { history, hasher }
    }

    pub async fn record(
        &self,
        event: HistoryEvent,
        now: DateTime<Utc>,
    ) -> Result<ApprovalHistory, RepositoryError> {
        let row = event.into_history(&self.hasher, now);
        self.history.append(row.clone()).await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use secrecy::SecretString;

    use tollgate_core::audit::{ActorContext, HistoryEvent, PiiHasher};
    use tollgate_core::domain::approval::{Approval, ApprovalStatus, ApprovalType, CartId};
    use tollgate_core::domain::settings::CompanyId;
    use tollgate_db::repositories::{ApprovalHistoryRepository, InMemoryApprovalHistoryRepository};

    use super::AuditTrailRecorder;

    fn approval() -> Approval {
        Approval::new_pending(
            CartId("cart-1".to_string()),
            CompanyId("comp-1".to_string()),
            ApprovalType::Admin,
            1,
            Utc::now(),
        )
    }

    fn is_hex_64(value: &str) -> bool {
        value.len() == 64 && value.chars().all(|ch| ch.is_ascii_hexdigit())
    }

    #[tokio::test]
    async fn recorded_row_keeps_hashes_and_drops_raw_actor_data() {
        let history = Arc::new(InMemoryApprovalHistoryRepository::default());
        let recorder = AuditTrailRecorder::new(history.clone(), PiiHasher::default());
        let approval = approval();
        let actor =
            ActorContext::new("user-1", "admin").with_ip("10.0.0.50").with_user_agent("Safari/17.0");

        let row = recorder
            .record(
                HistoryEvent::for_approval(&approval, Some(ApprovalStatus::Pending), actor)
                    .with_reason(Some("approved for Q4".to_string())),
                Utc::now(),
            )
            .await
            .expect("record");

        let stored = history.list_for_approval(&approval.id).await.expect("list");
        assert_eq!(stored, vec![row.clone()]);

        let ip_hash = row.actor_ip_hash.as_deref().expect("ip hash");
        let agent_hash = row.actor_user_agent_hash.as_deref().expect("user agent hash");
        assert!(is_hex_64(ip_hash));
        assert!(is_hex_64(agent_hash));
        assert_ne!(ip_hash, agent_hash);

        let rendered = format!("{row:?}");
        assert!(!rendered.contains("10.0.0.50"));
        assert!(!rendered.contains("Safari/17.0"));
        assert_eq!(row.reason.as_deref(), Some("approved for Q4"));
    }

    #[tokio::test]
    async fn pepper_changes_the_stored_hash() {
        let plain = AuditTrailRecorder::new(
            Arc::new(InMemoryApprovalHistoryRepository::default()),
            PiiHasher::default(),
        );
        let keyed = AuditTrailRecorder::new(
            Arc::new(InMemoryApprovalHistoryRepository::default()),
            PiiHasher::new(Some(SecretString::from("pepper-1".to_string()))),
        );
        let approval = approval();
        let event = HistoryEvent::for_approval(
            &approval,
            None,
            ActorContext::new("user-1", "admin").with_ip("10.0.0.50"),
        );

        let plain_row = plain.record(event.clone(), Utc::now()).await.expect("plain");
        let keyed_row = keyed.record(event, Utc::now()).await.expect("keyed");

        assert_ne!(plain_row.actor_ip_hash, keyed_row.actor_ip_hash);
        assert!(keyed_row.actor_ip_hash.as_deref().is_some_and(is_hex_64));
    }
}
