use clap::Parser;

use llmgate_common::{CoolingPeriodConfig, GlobalConfig, GlobalConfigPatch, ModelMapping};

/// CLI/env configuration surface, one field per configurable gateway knob.
/// Precedence is CLI flag > environment variable > built-in default, enforced
/// by only overlaying a field here when the user actually supplied it.
#[derive(Debug, Parser)]
#[command(name = "llmgate", about = "Reverse-proxy gateway for a generative-LLM upstream")]
pub struct CliArgs {
    #[arg(long, env = "LLMGATE_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "LLMGATE_PORT")]
    pub port: Option<u16>,

    /// Comma-separated upstream API keys.
    #[arg(long, env = "LLMGATE_CREDENTIALS", value_delimiter = ',')]
    pub credentials: Option<Vec<String>>,

    /// Comma-separated client-facing API keys. Omit to leave the client surface unauthenticated.
    #[arg(long, env = "LLMGATE_CLIENT_KEYS", value_delimiter = ',')]
    pub client_keys: Option<Vec<String>>,

    /// Comma-separated admin API keys.
    #[arg(long, env = "LLMGATE_ADMIN_KEYS", value_delimiter = ',')]
    pub admin_keys: Option<Vec<String>>,

    #[arg(long, env = "LLMGATE_MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,

    #[arg(long, env = "LLMGATE_PER_ATTEMPT_TIMEOUT_S")]
    pub per_attempt_timeout_s: Option<u64>,

    #[arg(long, env = "LLMGATE_OVERALL_DEADLINE_S")]
    pub overall_deadline_s: Option<u64>,

    #[arg(long, env = "LLMGATE_MAX_FAILURES_BEFORE_COOL")]
    pub max_failures_before_cool: Option<u32>,

    #[arg(long, env = "LLMGATE_COOLING_AUTH_S")]
    pub cooling_auth_s: Option<u64>,

    #[arg(long, env = "LLMGATE_COOLING_QUOTA_S")]
    pub cooling_quota_s: Option<u64>,

    #[arg(long, env = "LLMGATE_COOLING_TRANSIENT_S")]
    pub cooling_transient_s: Option<u64>,

    #[arg(long, env = "LLMGATE_CACHE_ENABLED")]
    pub cache_enabled: Option<bool>,

    #[arg(long, env = "LLMGATE_CACHE_MAX_SIZE")]
    pub cache_max_size: Option<u64>,

    #[arg(long, env = "LLMGATE_CACHE_TTL_S")]
    pub cache_ttl_s: Option<u64>,

    #[arg(long, env = "LLMGATE_UPSTREAM_BASE_URL")]
    pub upstream_base_url: Option<String>,

    #[arg(long, env = "LLMGATE_OUTBOUND_PROXY_URL")]
    pub outbound_proxy_url: Option<String>,

    /// JSON object `{"openai_name": "upstream_name", ...}`; falls back to the built-in table.
    #[arg(long, env = "LLMGATE_MODEL_MAPPING_JSON")]
    pub model_mapping_json: Option<String>,

    /// Upstream model used for names not present in `model_mapping_json`.
    #[arg(long, env = "LLMGATE_DEFAULT_UPSTREAM_MODEL")]
    pub default_upstream_model: Option<String>,
}

impl CliArgs {
    pub fn into_patch(self) -> Result<GlobalConfigPatch, anyhow::Error> {
        let cooling_period = if self.cooling_auth_s.is_some()
            || self.cooling_quota_s.is_some()
            || self.cooling_transient_s.is_some()
        {
            let defaults = CoolingPeriodConfig::default();
            Some(CoolingPeriodConfig {
                auth_s: self.cooling_auth_s.unwrap_or(defaults.auth_s),
                quota_s: self.cooling_quota_s.unwrap_or(defaults.quota_s),
                transient_s: self.cooling_transient_s.unwrap_or(defaults.transient_s),
            })
        } else {
            None
        };

        let model_mapping = match (self.model_mapping_json, self.default_upstream_model) {
            (None, None) => None,
            (map_json, default_model) => {
                let mut mapping = ModelMapping::default();
                if let Some(json) = map_json {
                    let parsed: std::collections::BTreeMap<String, String> =
                        serde_json::from_str(&json)
                            .map_err(|e| anyhow::anyhow!("invalid model mapping JSON: {e}"))?;
                    mapping.map = parsed;
                }
                if let Some(default_model) = default_model {
                    mapping.default_upstream_model = default_model;
                }
                Some(mapping)
            }
        };

        Ok(GlobalConfigPatch {
            host: self.host,
            port: self.port,
            credentials: self.credentials,
            client_keys: self.client_keys,
            admin_keys: self.admin_keys,
            max_attempts: self.max_attempts,
            per_attempt_timeout_s: self.per_attempt_timeout_s,
            overall_deadline_s: self.overall_deadline_s,
            max_failures_before_cool: self.max_failures_before_cool,
            cooling_period,
            cache_enabled: self.cache_enabled,
            cache_max_size: self.cache_max_size,
            cache_ttl_s: self.cache_ttl_s,
            upstream_base_url: self.upstream_base_url,
            outbound_proxy_url: self.outbound_proxy_url,
            model_mapping,
        })
    }
}

/// Parses CLI args/env vars, merges onto the built-in defaults, and produces
/// the final validated [`GlobalConfig`]. Parse failures abort startup rather
/// than silently defaulting.
pub fn bootstrap_config_from_env() -> Result<GlobalConfig, anyhow::Error> {
    let args = CliArgs::parse();
    let mut patch = GlobalConfigPatch::default();
    patch.overlay(args.into_patch()?);
    patch.into_config().map_err(anyhow::Error::from)
}
