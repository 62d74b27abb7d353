//! HTTP client for the membership registry (component A), used by every
//! other component on this node: B polls it for the active set, C rebuilds
//! the tree from it, D and E resolve the leader's address through it.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::protos::ServerId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: ServerId,
    pub address: String,
    pub lease_id: String,
    pub expires_at: DateTime<Utc>,
    pub is_leader: bool,
}

pub struct MembershipClient {
    base_url: String,
    http: reqwest::Client,
}

impl MembershipClient {
    pub fn new(membership_host: &str, timeout: Duration) -> Self {
        MembershipClient {
            base_url: format!("http://{}", membership_host),
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("failed to build membership http client"),
        }
    }

    pub async fn register(&self, id: ServerId, address: &str) -> Result<String> {
        #[derive(Serialize)]
        struct Req<'a> {
            id: ServerId,
            address: &'a str,
        }
        #[derive(Deserialize)]
        struct Resp {
            lease_id: String,
        }

        let resp: Resp = self
            .http
            .post(format!("{}/register", self.base_url))
            .json(&Req { id, address })
            .send()
            .await
            .map_err(|e| Error::Transient(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::Transient(e.to_string()))?;

        Ok(resp.lease_id)
    }

    pub async fn keepalive(&self, id: ServerId, address: &str, is_leader: bool) -> Result<()> {
        #[derive(Serialize)]
        struct Req<'a> {
            id: ServerId,
            address: &'a str,
            is_leader: bool,
        }

        self.http
            .post(format!("{}/keepalive", self.base_url))
            .json(&Req { id, address, is_leader })
            .send()
            .await
            .map_err(|e| Error::Transient(e.to_string()))?;

        Ok(())
    }

    pub async fn members(&self) -> Result<HashMap<ServerId, MemberInfo>> {
        let by_string_key: HashMap<String, MemberInfo> = self
            .http
            .get(format!("{}/members", self.base_url))
            .send()
            .await
            .map_err(|e| Error::Transient(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::Transient(e.to_string()))?;

        Ok(by_string_key
            .into_values()
            .map(|m| (m.id, m))
            .collect())
    }

    /// Resolves the current leader's address from the membership snapshot,
    /// retrying up to `max_retries` on transient failure.
    pub async fn resolve_leader(&self, max_retries: u32, backoff: Duration) -> Result<MemberInfo> {
        let mut attempt = 0;
        loop {
            let result = self.members().await.and_then(|members| {
                let now = Utc::now();
                members
                    .into_values()
                    .find(|m| m.is_leader && m.expires_at > now)
                    .ok_or_else(|| Error::Transient("no leader in membership snapshot".into()))
            });

            match result {
                Ok(leader) => return Ok(leader),
                Err(e) if e.is_transient() && attempt < max_retries => {
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
