//! Provider/endpoint/key configuration and candidate selection.
//!
//! A candidate is one concrete (provider, endpoint, key) triple that can
//! serve a requested model. Selection flattens the configured hierarchy into
//! one deterministic ordered list across all providers: provider priority
//! ascending, then endpoint priority ascending, then key priority ascending,
//! then configuration order. Entries that cannot serve traffic right now
//! (disabled, quota-exhausted, expired) are excluded before ordering, so the
//! failover loop never wastes an attempt on them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use url::Url;

/// Wire dialect an endpoint (or client) speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiDialect {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    Gemini,
}

impl ApiDialect {
    pub fn as_str(self) -> &'static str {
        match self {
            ApiDialect::Anthropic => "anthropic",
            ApiDialect::OpenAi => "openai",
            ApiDialect::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for ApiDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    /// Lower ranks ahead of higher across providers.
    #[serde(default = "default_provider_priority")]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub api_dialect: ApiDialect,
    /// Requested model name -> upstream model name. A model absent from the
    /// map is not served by this provider.
    #[serde(default)]
    pub models: HashMap<String, String>,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub id: String,
    pub base_url: Url,
    #[serde(default)]
    pub priority: i32,
    /// `None` or `Some(0)` means unlimited.
    #[serde(default)]
    pub max_concurrent: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub keys: Vec<ApiKeyConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiKeyConfig {
    pub id: String,
    pub secret: SecretString,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub max_concurrent: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub quota_exhausted: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

fn default_provider_priority() -> i32 {
    100
}

impl ApiKeyConfig {
    fn usable(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && !self.quota_exhausted
            && self.expires_at.is_none_or(|expiry| expiry > now)
    }
}

/// One concrete routing target: everything an attempt needs to call one
/// upstream with one key.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub provider_id: String,
    pub provider_name: String,
    pub dialect: ApiDialect,
    pub endpoint_id: String,
    pub base_url: Url,
    pub endpoint_max_concurrent: Option<u64>,
    pub key_id: String,
    pub secret: SecretString,
    pub key_max_concurrent: Option<u64>,
    /// Upstream model name after the provider's mapping.
    pub mapped_model: String,
}

/// Source of routing candidates. The dispatcher depends on this trait so
/// tests can supply fixed candidate lists without building full configs.
pub trait ProviderDirectory: Send + Sync {
    /// All candidates able to serve `model`, in failover order.
    fn candidates_for_model(&self, model: &str) -> Vec<Candidate>;

    /// Whether an endpoint with this id is configured (enabled or not).
    /// Directories that cannot enumerate their entries may claim everything.
    fn endpoint_exists(&self, _endpoint_id: &str) -> bool {
        true
    }

    /// Whether a key with this id is configured (enabled or not).
    fn key_exists(&self, _key_id: &str) -> bool {
        true
    }

    /// Configured concurrency ceiling for an endpoint. `None` when the
    /// endpoint is unlimited or the directory cannot look it up.
    fn endpoint_max_concurrent(&self, _endpoint_id: &str) -> Option<u64> {
        None
    }

    /// Configured concurrency ceiling for a key.
    fn key_max_concurrent(&self, _key_id: &str) -> Option<u64> {
        None
    }
}

/// Directory backed by the static provider configuration.
pub struct StaticDirectory {
    providers: Vec<ProviderConfig>,
}

impl StaticDirectory {
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        Self { providers }
    }
}

impl ProviderDirectory for StaticDirectory {
    fn candidates_for_model(&self, model: &str) -> Vec<Candidate> {
        let now = Utc::now();
        let mut ranked: Vec<((i32, i32, i32), Candidate)> = Vec::new();

        for provider in &self.providers {
            if !provider.enabled {
                continue;
            }
            let Some(mapped_model) = provider.models.get(model) else {
                continue;
            };
            for endpoint in provider.endpoints.iter().filter(|e| e.enabled) {
                for key in endpoint.keys.iter().filter(|k| k.usable(now)) {
                    ranked.push((
                        (provider.priority, endpoint.priority, key.priority),
                        Candidate {
                            provider_id: provider.id.clone(),
                            provider_name: provider.name.clone(),
                            dialect: provider.api_dialect,
                            endpoint_id: endpoint.id.clone(),
                            base_url: endpoint.base_url.clone(),
                            endpoint_max_concurrent: endpoint.max_concurrent,
                            key_id: key.id.clone(),
                            secret: key.secret.clone(),
                            key_max_concurrent: key.max_concurrent,
                            mapped_model: mapped_model.clone(),
                        },
                    ));
                }
            }
        }
        // One total order over every triple, regardless of which provider
        // it came from. The sort is stable, so equal priorities fall back
        // to configuration order.
        ranked.sort_by_key(|(rank, _)| *rank);
        ranked.into_iter().map(|(_, candidate)| candidate).collect()
    }

    fn endpoint_exists(&self, endpoint_id: &str) -> bool {
        self.providers
            .iter()
            .flat_map(|p| &p.endpoints)
            .any(|e| e.id == endpoint_id)
    }

    fn key_exists(&self, key_id: &str) -> bool {
        self.providers
            .iter()
            .flat_map(|p| &p.endpoints)
            .flat_map(|e| &e.keys)
            .any(|k| k.id == key_id)
    }

    fn endpoint_max_concurrent(&self, endpoint_id: &str) -> Option<u64> {
        self.providers
            .iter()
            .flat_map(|p| &p.endpoints)
            .find(|e| e.id == endpoint_id)
            .and_then(|e| e.max_concurrent)
    }

    fn key_max_concurrent(&self, key_id: &str) -> Option<u64> {
        self.providers
            .iter()
            .flat_map(|p| &p.endpoints)
            .flat_map(|e| &e.keys)
            .find(|k| k.id == key_id)
            .and_then(|k| k.max_concurrent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key(id: &str, priority: i32) -> ApiKeyConfig {
        ApiKeyConfig {
            id: id.to_string(),
            secret: SecretString::from("sk-test"),
            priority,
            max_concurrent: None,
            enabled: true,
            quota_exhausted: false,
            expires_at: None,
        }
    }

    fn endpoint(id: &str, priority: i32, keys: Vec<ApiKeyConfig>) -> EndpointConfig {
        EndpointConfig {
            id: id.to_string(),
            base_url: "https://api.example.com".parse().unwrap(),
            priority,
            max_concurrent: None,
            enabled: true,
            keys,
        }
    }

    fn provider(id: &str, endpoints: Vec<EndpointConfig>) -> ProviderConfig {
        ProviderConfig {
            id: id.to_string(),
            name: format!("{id}-name"),
            priority: default_provider_priority(),
            enabled: true,
            api_dialect: ApiDialect::Anthropic,
            models: HashMap::from([("claude-sonnet-4".to_string(), "claude-sonnet-4".to_string())]),
            endpoints,
        }
    }

    fn endpoint_order(directory: &StaticDirectory) -> Vec<String> {
        directory
            .candidates_for_model("claude-sonnet-4")
            .into_iter()
            .map(|c| c.endpoint_id)
            .collect()
    }

    #[test]
    fn test_endpoints_ordered_by_priority_ascending() {
        let directory = StaticDirectory::new(vec![provider(
            "p1",
            vec![
                endpoint("ep-30", 30, vec![key("k", 0)]),
                endpoint("ep-10", 10, vec![key("k", 0)]),
                endpoint("ep-20", 20, vec![key("k", 0)]),
            ],
        )]);
        assert_eq!(endpoint_order(&directory), vec!["ep-10", "ep-20", "ep-30"]);
    }

    #[test]
    fn test_endpoint_priority_orders_across_providers() {
        // A lower-priority endpoint must rank first even when its provider
        // appears later in the configuration.
        let directory = StaticDirectory::new(vec![
            provider("p-first", vec![endpoint("ep-10", 10, vec![key("k", 0)])]),
            provider("p-second", vec![endpoint("ep-5", 5, vec![key("k", 0)])]),
        ]);
        assert_eq!(endpoint_order(&directory), vec!["ep-5", "ep-10"]);
    }

    #[test]
    fn test_provider_priority_ranks_ahead_of_endpoint_priority() {
        let mut preferred = provider("p-preferred", vec![endpoint("ep-50", 50, vec![key("k", 0)])]);
        preferred.priority = 1;
        let directory = StaticDirectory::new(vec![
            provider("p-default", vec![endpoint("ep-5", 5, vec![key("k", 0)])]),
            preferred,
        ]);
        assert_eq!(endpoint_order(&directory), vec!["ep-50", "ep-5"]);
    }

    #[test]
    fn test_keys_ordered_within_endpoint_then_config_order_breaks_ties() {
        let directory = StaticDirectory::new(vec![provider(
            "p1",
            vec![endpoint(
                "ep",
                0,
                vec![key("k-b", 5), key("k-a", 1), key("k-c", 5)],
            )],
        )]);
        let key_order: Vec<String> = directory
            .candidates_for_model("claude-sonnet-4")
            .into_iter()
            .map(|c| c.key_id)
            .collect();
        assert_eq!(key_order, vec!["k-a", "k-b", "k-c"]);
    }

    #[test]
    fn test_ineligible_entries_are_excluded() {
        let mut disabled_endpoint = endpoint("ep-disabled", 5, vec![key("k", 0)]);
        disabled_endpoint.enabled = false;

        let mut exhausted = key("k-exhausted", 0);
        exhausted.quota_exhausted = true;
        let mut expired = key("k-expired", 0);
        expired.expires_at = Some(Utc::now() - Duration::hours(1));
        let mut future_expiry = key("k-live", 0);
        future_expiry.expires_at = Some(Utc::now() + Duration::hours(1));

        let directory = StaticDirectory::new(vec![provider(
            "p1",
            vec![
                disabled_endpoint,
                endpoint("ep-live", 10, vec![exhausted, expired, future_expiry]),
            ],
        )]);

        let candidates = directory.candidates_for_model("claude-sonnet-4");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].endpoint_id, "ep-live");
        assert_eq!(candidates[0].key_id, "k-live");
    }

    #[test]
    fn test_unknown_model_and_disabled_provider_yield_nothing() {
        let mut off = provider("p-off", vec![endpoint("ep", 0, vec![key("k", 0)])]);
        off.enabled = false;
        let directory = StaticDirectory::new(vec![off]);
        assert!(directory.candidates_for_model("claude-sonnet-4").is_empty());

        let directory =
            StaticDirectory::new(vec![provider("p1", vec![endpoint("ep", 0, vec![key("k", 0)])])]);
        assert!(directory.candidates_for_model("unknown-model").is_empty());
    }

    #[test]
    fn test_configured_ceilings_are_looked_up_by_id() {
        let mut ep = endpoint("ep-capped", 0, vec![key("k-capped", 0)]);
        ep.max_concurrent = Some(16);
        ep.keys[0].max_concurrent = Some(4);
        let directory = StaticDirectory::new(vec![provider("p1", vec![ep])]);

        assert_eq!(directory.endpoint_max_concurrent("ep-capped"), Some(16));
        assert_eq!(directory.key_max_concurrent("k-capped"), Some(4));
        assert_eq!(directory.endpoint_max_concurrent("absent"), None);
        assert_eq!(directory.key_max_concurrent("absent"), None);
    }

    #[test]
    fn test_model_mapping_is_applied() {
        let mut p = provider("p1", vec![endpoint("ep", 0, vec![key("k", 0)])]);
        p.models
            .insert("gpt-4o".to_string(), "acme-gpt-4o-2025".to_string());
        let directory = StaticDirectory::new(vec![p]);
        let candidates = directory.candidates_for_model("gpt-4o");
        assert_eq!(candidates[0].mapped_model, "acme-gpt-4o-2025");
    }
}
