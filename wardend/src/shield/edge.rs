//! Edge provider capability: IP-level access rules installed in front of
//! the operator's public endpoints.
//!
//! The Cloudflare-backed client is the production implementation; tests use
//! in-memory fakes of the same trait.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::{AgentError, AgentResult};

/// Rule modes supported at the edge.
pub const MODE_BLOCK: &str = "block";
pub const MODE_CHALLENGE: &str = "challenge";
pub const MODE_WHITELIST: &str = "whitelist";

#[derive(Debug, Clone, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessRule {
    pub id: String,
}

#[async_trait]
pub trait EdgeProvider: Send + Sync {
    async fn list_zones(&self) -> AgentResult<Vec<Zone>>;
    async fn get_zone(&self, zone_id: &str) -> AgentResult<Zone>;
    async fn create_access_rule(
        &self,
        zone_id: &str,
        mode: &str,
        ip: &str,
        notes: &str,
    ) -> AgentResult<AccessRule>;
    async fn delete_access_rule(&self, zone_id: &str, rule_id: &str) -> AgentResult<()>;
    async fn verify_credentials(&self) -> AgentResult<bool>;
}

const API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Cloudflare v4 API client.
pub struct CloudflareClient {
    api_token: String,
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiError>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl CloudflareClient {
    pub fn new(api_token: &str) -> Self {
        Self::with_base_url(api_token, API_BASE)
    }

    pub fn with_base_url(api_token: &str, base_url: &str) -> Self {
        Self {
            api_token: api_token.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("building http client"),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_token)
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> AgentResult<T> {
        let status = response.status();
        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| AgentError::Internal(format!("decoding edge response: {}", e)))?;
        if !envelope.success {
            let detail = envelope
                .errors
                .first()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| format!("status {}", status));
            return Err(AgentError::Internal(format!("edge API error: {}", detail)));
        }
        envelope
            .result
            .ok_or_else(|| AgentError::Internal("edge API returned no result".into()))
    }
}

#[async_trait]
impl EdgeProvider for CloudflareClient {
    async fn list_zones(&self) -> AgentResult<Vec<Zone>> {
        let response = self
            .request(reqwest::Method::GET, "/zones?per_page=50")
            .send()
            .await
            .map_err(|e| AgentError::Internal(format!("listing zones: {}", e)))?;
        Self::parse(response).await
    }

    async fn get_zone(&self, zone_id: &str) -> AgentResult<Zone> {
        let response = self
            .request(reqwest::Method::GET, &format!("/zones/{}", zone_id))
            .send()
            .await
            .map_err(|e| AgentError::Internal(format!("fetching zone: {}", e)))?;
        Self::parse(response).await
    }

    async fn create_access_rule(
        &self,
        zone_id: &str,
        mode: &str,
        ip: &str,
        notes: &str,
    ) -> AgentResult<AccessRule> {
        let body = json!({
            "mode": mode,
            "configuration": { "target": "ip", "value": ip },
            "notes": notes,
        });
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/zones/{}/firewall/access_rules/rules", zone_id),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Internal(format!("creating access rule: {}", e)))?;
        Self::parse(response).await
    }

    async fn delete_access_rule(&self, zone_id: &str, rule_id: &str) -> AgentResult<()> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/zones/{}/firewall/access_rules/rules/{}", zone_id, rule_id),
            )
            .send()
            .await
            .map_err(|e| AgentError::Internal(format!("deleting access rule: {}", e)))?;
        let _: serde_json::Value = Self::parse(response).await?;
        Ok(())
    }

    async fn verify_credentials(&self) -> AgentResult<bool> {
        let response = self
            .request(reqwest::Method::GET, "/user/tokens/verify")
            .send()
            .await
            .map_err(|e| AgentError::Internal(format!("verifying credentials: {}", e)))?;
        match Self::parse::<serde_json::Value>(response).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory edge provider for blocker and manager tests.

    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeEdge {
        next_id: AtomicU64,
        pub zones: Vec<Zone>,
        /// (zone_id, rule_id, ip) triples currently installed.
        pub rules: Mutex<Vec<(String, String, String)>>,
        /// When set, create/delete calls fail.
        pub fail: std::sync::atomic::AtomicBool,
    }

    impl FakeEdge {
        pub fn with_zones(names: &[&str]) -> Self {
            Self {
                zones: names
                    .iter()
                    .map(|n| Zone {
                        id: format!("zone-{}", n),
                        name: n.to_string(),
                    })
                    .collect(),
                ..Default::default()
            }
        }

        pub fn rule_count(&self) -> usize {
            self.rules.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl EdgeProvider for FakeEdge {
        async fn list_zones(&self) -> AgentResult<Vec<Zone>> {
            Ok(self.zones.clone())
        }

        async fn get_zone(&self, zone_id: &str) -> AgentResult<Zone> {
            self.zones
                .iter()
                .find(|z| z.id == zone_id)
                .cloned()
                .ok_or_else(|| AgentError::NotFound(format!("zone {}", zone_id)))
        }

        async fn create_access_rule(
            &self,
            zone_id: &str,
            _mode: &str,
            ip: &str,
            _notes: &str,
        ) -> AgentResult<AccessRule> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AgentError::Internal("edge unavailable".into()));
            }
            let id = format!("rule-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.rules
                .lock()
                .unwrap()
                .push((zone_id.to_string(), id.clone(), ip.to_string()));
            Ok(AccessRule { id })
        }

        async fn delete_access_rule(&self, zone_id: &str, rule_id: &str) -> AgentResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AgentError::Internal("edge unavailable".into()));
            }
            let mut rules = self.rules.lock().unwrap();
            let before = rules.len();
            rules.retain(|(z, r, _)| !(z == zone_id && r == rule_id));
            if rules.len() == before {
                return Err(AgentError::NotFound(format!("rule {}", rule_id)));
            }
            Ok(())
        }

        async fn verify_credentials(&self) -> AgentResult<bool> {
            Ok(true)
        }
    }
}
