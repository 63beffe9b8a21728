use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub agents: AgentsConfig,
    pub providers: ProvidersConfig,
    pub tools: ToolsConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    /// Generation model used for every conversation agent.
    pub model: String,
    /// Agents idle longer than this are reaped.
    pub inactivity_threshold_secs: u64,
    /// How often the reaper sweeps the registry.
    pub reaper_interval_secs: u64,
    /// Minimum time between partial-text flushes to the outbound message.
    pub flush_interval_ms: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-pro".into(),
            inactivity_threshold_secs: 8 * 60 * 60,
            reaper_interval_secs: 5,
            flush_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersConfig {
    pub gemini: GeminiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeminiConfig {
    /// Required. Falls back to the GEMINI_API_KEY env var.
    pub api_key: String,
    pub api_base: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: "https://generativelanguage.googleapis.com/v1beta".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchConfig {
    /// Optional. Falls back to the TAVILY_API_KEY env var.
    /// When absent the tool degrades to a structured error response.
    pub api_key: String,
    pub endpoint: String,
    pub search_depth: String,
    pub max_results: u32,
    pub include_answer: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: "https://api.tavily.com/search".into(),
            search_depth: "advanced".into(),
            max_results: 5,
            include_answer: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 18990,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design_values() {
        let cfg: Config = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(cfg.agents.inactivity_threshold_secs, 28_800);
        assert_eq!(cfg.agents.reaper_interval_secs, 5);
        assert_eq!(cfg.agents.flush_interval_ms, 1000);
        assert_eq!(cfg.tools.search.search_depth, "advanced");
        assert_eq!(cfg.tools.search.max_results, 5);
        assert!(cfg.tools.search.include_answer);
    }

    #[test]
    fn camel_case_fields_parsed() {
        let cfg: Config = serde_json::from_value(serde_json::json!({
            "agents": {
                "model": "gemini-2.0-flash",
                "inactivityThresholdSecs": 60,
                "flushIntervalMs": 250
            },
            "providers": {
                "gemini": { "apiKey": "key-123" }
            }
        }))
        .unwrap();
        assert_eq!(cfg.agents.model, "gemini-2.0-flash");
        assert_eq!(cfg.agents.inactivity_threshold_secs, 60);
        assert_eq!(cfg.agents.flush_interval_ms, 250);
        assert_eq!(cfg.providers.gemini.api_key, "key-123");
        // untouched sections keep defaults
        assert_eq!(cfg.gateway.port, 18990);
    }
}
