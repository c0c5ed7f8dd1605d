use std::fmt;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::approval::{Approval, ApprovalId, ApprovalStatus, CartId};
use crate::domain::history::{ApprovalHistory, ApprovalHistoryId};

type HmacSha256 = Hmac<Sha256>;

pub const SYSTEM_ACTOR_ID: &str = "system";
pub const SYSTEM_ACTOR_ROLE: &str = "system";

/// Identity of whoever triggered a transition, as resolved by the caller.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ActorContext {
    pub id: String,
    pub role: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl ActorContext {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self { id: id.into(), role: role.into(), ip: None, user_agent: None }
    }

    pub fn system() -> Self {
        Self::new(SYSTEM_ACTOR_ID, SYSTEM_ACTOR_ROLE)
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

impl fmt::Debug for ActorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorContext")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("ip", &self.ip.as_ref().map(|_| "<redacted>"))
            .field("user_agent", &self.user_agent.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A status event about to be written to the audit trail, still carrying raw actor data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEvent {
    pub approval_id: ApprovalId,
    pub cart_id: CartId,
    pub previous_status: Option<ApprovalStatus>,
    pub new_status: ApprovalStatus,
    pub actor: ActorContext,
    pub reason: Option<String>,
    pub cart_total_at_action: Option<Decimal>,
}

impl HistoryEvent {
    pub fn for_approval(
        approval: &Approval,
        previous_status: Option<ApprovalStatus>,
        actor: ActorContext,
    ) -> Self {
        Self {
            approval_id: approval.id.clone(),
            cart_id: approval.cart_id.clone(),
            previous_status,
            new_status: approval.status,
            actor,
            reason: None,
            cart_total_at_action: None,
        }
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    pub fn with_cart_total(mut self, cart_total: Option<Decimal>) -> Self {
        self.cart_total_at_action = cart_total;
        self
    }

    /// Consumes the event; raw IP and user agent do not survive into the row.
    pub fn into_history(self, hasher: &PiiHasher, now: DateTime<Utc>) -> ApprovalHistory {
        let ActorContext { id: actor_id, role: actor_role, ip, user_agent } = self.actor;
        ApprovalHistory {
            id: ApprovalHistoryId(Uuid::new_v4().to_string()),
            approval_id: self.approval_id,
            cart_id: self.cart_id,
            previous_status: self.previous_status,
            new_status: self.new_status,
            actor_id,
            actor_role,
            actor_ip_hash: hasher.hash_optional(ip.as_deref()),
            actor_user_agent_hash: hasher.hash_optional(user_agent.as_deref()),
            reason: self.reason,
            cart_total_at_action: self.cart_total_at_action,
            action_timestamp: now,
        }
    }
}

/// One-way hashing for actor identifiers. Keyed with HMAC-SHA256 when a pepper is set,
/// plain SHA-256 otherwise.
#[derive(Clone, Default)]
pub struct PiiHasher {
    pepper: Option<SecretString>,
}

impl PiiHasher {
    pub fn new(pepper: Option<SecretString>) -> Self {
        let pepper = pepper.filter(|value| !value.expose_secret().is_empty());
        Self { pepper }
    }

    pub fn hash(&self, raw: &str) -> String {
        match &self.pepper {
            Some(pepper) => hmac_hex(pepper.expose_secret().as_bytes(), raw.as_bytes()),
            None => sha256_hex(raw.as_bytes()),
        }
    }

    pub fn hash_optional(&self, raw: Option<&str>) -> Option<String> {
        raw.map(str::trim).filter(|value| !value.is_empty()).map(|value| self.hash(value))
    }
}

impl fmt::Debug for PiiHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PiiHasher").field("keyed", &self.pepper.is_some()).finish()
    }
}

fn hmac_hex(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return sha256_hex(payload),
    };
    mac.update(payload);
    encode_hex(mac.finalize().into_bytes().as_slice())
}

fn sha256_hex(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    encode_hex(digest.as_slice())
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;
    use secrecy::SecretString;

    use super::{ActorContext, HistoryEvent, PiiHasher};
    use crate::domain::approval::{Approval, ApprovalStatus, ApprovalType, CartId};
    use crate::domain::settings::CompanyId;

    fn is_hex_64(value: &str) -> bool {
        value.len() == 64 && value.chars().all(|ch| ch.is_ascii_hexdigit())
    }

    fn approval() -> Approval {
        Approval::new_pending(
            CartId("cart-9".to_string()),
            CompanyId("comp-1".to_string()),
            ApprovalType::Admin,
            1,
            Utc::now(),
        )
    }

    #[test]
    fn history_row_holds_hashes_and_never_raw_actor_data() {
        let actor = ActorContext::new("user-7", "admin")
            .with_ip("10.0.0.50")
            .with_user_agent("Safari/17.0");
        let row = HistoryEvent::for_approval(&approval(), Some(ApprovalStatus::Pending), actor)
            .with_reason(Some("within budget".to_string()))
            .with_cart_total(Some(Decimal::new(15000, 0)))
            .into_history(&PiiHasher::default(), Utc::now());

        let ip_hash = row.actor_ip_hash.clone().expect("ip hash");
        let agent_hash = row.actor_user_agent_hash.clone().expect("user agent hash");
        assert!(is_hex_64(&ip_hash));
        assert!(is_hex_64(&agent_hash));
        assert_ne!(ip_hash, agent_hash);

        let serialized = serde_json::to_string(&row).expect("serialize row");
        assert!(!serialized.contains("10.0.0.50"));
        assert!(!serialized.contains("Safari/17.0"));
        assert_eq!(row.reason.as_deref(), Some("within budget"));
    }

    #[test]
    fn plain_hash_matches_known_sha256_digest() {
        assert_eq!(
            PiiHasher::default().hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn pepper_changes_digest_but_keeps_format() {
        let keyed_hasher = PiiHasher::new(Some(SecretString::from("pepper-value".to_string())));
        let plain = PiiHasher::default().hash("10.0.0.50");
        let keyed = keyed_hasher.hash("10.0.0.50");

        assert_ne!(plain, keyed);
        assert!(is_hex_64(&keyed));
        assert!(!format!("{keyed_hasher:?}").contains("pepper-value"));
    }

    #[test]
    fn missing_or_blank_actor_data_yields_no_hash() {
        let hasher = PiiHasher::default();
        assert_eq!(hasher.hash_optional(None), None);
        assert_eq!(hasher.hash_optional(Some("  ")), None);
    }

    #[test]
    fn actor_debug_output_redacts_network_identifiers() {
        let actor = ActorContext::new("user-7", "admin").with_ip("10.0.0.50");
        let debug = format!("{actor:?}");
        assert!(!debug.contains("10.0.0.50"));
        assert!(debug.contains("user-7"));
    }
}
