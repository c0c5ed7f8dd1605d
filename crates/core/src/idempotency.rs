use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::approval::{ApprovalType, CartId};

/// Stable fingerprint of a (cart, approval type) pair; 64 lowercase hex characters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(pub String);

pub fn derive_key(cart_id: &CartId, approval_type: ApprovalType) -> IdempotencyKey {
    // Length prefix keeps `("a:b", x)` and `("a", "b:x")` style inputs apart.
    let material = format!("{}:{}|{}", cart_id.0.len(), cart_id.0, approval_type.as_str());
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    IdempotencyKey(format!("{:x}", hasher.finalize()))
}
