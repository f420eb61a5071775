use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("no upstream credentials configured")]
    NoCredentials,
    #[error("invalid model mapping JSON: {0}")]
    InvalidModelMapping(String),
}

/// Per-kind cooling durations, in seconds, as accepted from configuration.
///
/// Converted into `llmgate_credential::CoolingPeriods` at bootstrap; kept as a
/// plain duration-in-seconds struct here so this crate stays free of the
/// credential pool's types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoolingPeriodConfig {
    pub auth_s: u64,
    pub quota_s: u64,
    pub transient_s: u64,
}

impl Default for CoolingPeriodConfig {
    fn default() -> Self {
        Self {
            auth_s: 60 * 60,
            quota_s: 5 * 60,
            transient_s: 30,
        }
    }
}

/// `{openai_name -> upstream_name}` plus a default for unmapped/native names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMapping {
    pub map: BTreeMap<String, String>,
    pub default_upstream_model: String,
}

impl ModelMapping {
    /// Resolves an OpenAI-surface model name to the upstream model name.
    ///
    /// A name present in the table maps to its configured upstream model. A
    /// name that already looks like a native upstream model (e.g. a
    /// `gemini-...` name, or a `models/...` path) passes through unchanged.
    /// Anything else is assumed to be an unrecognized OpenAI-style alias and
    /// falls back to `default_upstream_model`.
    pub fn resolve(&self, openai_model: &str) -> String {
        if let Some(mapped) = self.map.get(openai_model) {
            return mapped.clone();
        }
        if looks_like_native_model(openai_model) {
            return openai_model.to_string();
        }
        self.default_upstream_model.clone()
    }

    /// The list of OpenAI-style names this gateway advertises via `/v1/models`.
    pub fn advertised_names(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }

    fn default_table() -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("gpt-3.5-turbo".to_string(), "gemini-1.5-flash".to_string());
        map.insert("gpt-4".to_string(), "gemini-1.5-pro".to_string());
        map.insert("gpt-4o".to_string(), "gemini-1.5-pro".to_string());
        map.insert("gpt-4o-mini".to_string(), "gemini-1.5-flash".to_string());
        map
    }
}

fn looks_like_native_model(name: &str) -> bool {
    name.starts_with("gemini") || name.starts_with("models/")
}

impl Default for ModelMapping {
    fn default() -> Self {
        Self {
            map: Self::default_table(),
            default_upstream_model: "gemini-1.5-pro".to_string(),
        }
    }
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > built-in default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,

    /// Upstream API keys. Never logged; only `Credential::id` (a short
    /// prefix) is surfaced in traces or `/stats`.
    pub credentials: Vec<String>,
    pub client_keys: Vec<String>,
    pub admin_keys: Vec<String>,

    pub max_attempts: u32,
    pub per_attempt_timeout_s: u64,
    pub overall_deadline_s: u64,
    pub max_failures_before_cool: u32,
    pub cooling_period: CoolingPeriodConfig,

    pub cache_enabled: bool,
    pub cache_max_size: u64,
    pub cache_ttl_s: u64,

    pub upstream_base_url: String,
    pub outbound_proxy_url: Option<String>,

    pub model_mapping: ModelMapping,
}

/// Optional layer used for merging global config from CLI/env sources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub credentials: Option<Vec<String>>,
    pub client_keys: Option<Vec<String>>,
    pub admin_keys: Option<Vec<String>>,
    pub max_attempts: Option<u32>,
    pub per_attempt_timeout_s: Option<u64>,
    pub overall_deadline_s: Option<u64>,
    pub max_failures_before_cool: Option<u32>,
    pub cooling_period: Option<CoolingPeriodConfig>,
    pub cache_enabled: Option<bool>,
    pub cache_max_size: Option<u64>,
    pub cache_ttl_s: Option<u64>,
    pub upstream_base_url: Option<String>,
    pub outbound_proxy_url: Option<String>,
    pub model_mapping: Option<ModelMapping>,
}

impl GlobalConfigPatch {
    /// Overlays `other` on top of `self`, preferring `other`'s fields where set.
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(host);
        take!(port);
        take!(credentials);
        take!(client_keys);
        take!(admin_keys);
        take!(max_attempts);
        take!(per_attempt_timeout_s);
        take!(overall_deadline_s);
        take!(max_failures_before_cool);
        take!(cooling_period);
        take!(cache_enabled);
        take!(cache_max_size);
        take!(cache_ttl_s);
        take!(upstream_base_url);
        take!(outbound_proxy_url);
        take!(model_mapping);
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        let credentials = self.credentials.unwrap_or_default();
        if credentials.is_empty() {
            return Err(GlobalConfigError::NoCredentials);
        }
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8787),
            credentials,
            client_keys: self.client_keys.unwrap_or_default(),
            admin_keys: self
                .admin_keys
                .ok_or(GlobalConfigError::MissingField("admin_keys"))?,
            max_attempts: self.max_attempts.unwrap_or(3),
            per_attempt_timeout_s: self.per_attempt_timeout_s.unwrap_or(30),
            overall_deadline_s: self.overall_deadline_s.unwrap_or(60),
            max_failures_before_cool: self.max_failures_before_cool.unwrap_or(3),
            cooling_period: self.cooling_period.unwrap_or_default(),
            cache_enabled: self.cache_enabled.unwrap_or(true),
            cache_max_size: self.cache_max_size.unwrap_or(1024),
            cache_ttl_s: self.cache_ttl_s.unwrap_or(300),
            upstream_base_url: self
                .upstream_base_url
                .ok_or(GlobalConfigError::MissingField("upstream_base_url"))?,
            outbound_proxy_url: self.outbound_proxy_url,
            model_mapping: self.model_mapping.unwrap_or_default(),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            credentials: Some(value.credentials),
            client_keys: Some(value.client_keys),
            admin_keys: Some(value.admin_keys),
            max_attempts: Some(value.max_attempts),
            per_attempt_timeout_s: Some(value.per_attempt_timeout_s),
            overall_deadline_s: Some(value.overall_deadline_s),
            max_failures_before_cool: Some(value.max_failures_before_cool),
            cooling_period: Some(value.cooling_period),
            cache_enabled: Some(value.cache_enabled),
            cache_max_size: Some(value.cache_max_size),
            cache_ttl_s: Some(value.cache_ttl_s),
            upstream_base_url: Some(value.upstream_base_url),
            outbound_proxy_url: value.outbound_proxy_url,
            model_mapping: Some(value.model_mapping),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_mapping_resolves_known_alias() {
        let mapping = ModelMapping::default();
        assert_eq!(mapping.resolve("gpt-4o"), "gemini-1.5-pro");
    }

    #[test]
    fn model_mapping_passes_through_unknown_native_names() {
        let mapping = ModelMapping::default();
        assert_eq!(mapping.resolve("gemini-1.5-flash-8b"), "gemini-1.5-flash-8b");
        assert_eq!(mapping.resolve("models/gemini-2.5-pro"), "models/gemini-2.5-pro");
    }

    #[test]
    fn model_mapping_falls_back_to_default_for_unrecognized_openai_style_names() {
        let mapping = ModelMapping::default();
        assert_eq!(mapping.resolve("gpt-5"), mapping.default_upstream_model);
    }

    #[test]
    fn patch_requires_credentials() {
        let patch = GlobalConfigPatch {
            admin_keys: Some(vec!["admin".into()]),
            upstream_base_url: Some("https://example.test".into()),
            ..Default::default()
        };
        assert!(matches!(
            patch.into_config(),
            Err(GlobalConfigError::NoCredentials)
        ));
    }
}
