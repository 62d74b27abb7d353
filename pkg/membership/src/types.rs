use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// {id, address, lease expiry, leader flag} — see DATA MODEL, "Membership entry".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipEntry {
    pub id: u64,
    pub address: String,
    pub lease_id: String,
    pub expires_at: DateTime<Utc>,
    pub is_leader: bool,
}

impl MembershipEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub id: u64,
    pub address: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub lease_id: String,
}

#[derive(Debug, Deserialize)]
pub struct KeepaliveRequest {
    pub id: u64,
    pub address: String,
    pub is_leader: bool,
}
