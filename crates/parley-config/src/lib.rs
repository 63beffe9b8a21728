pub mod loader;
pub mod schema;

pub use loader::{apply_env, apply_process_env, find_config_path, load_config};
pub use schema::{
    AgentsConfig, Config, GatewayConfig, GeminiConfig, ProvidersConfig, SearchConfig, ToolsConfig,
};
