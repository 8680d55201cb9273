//! Configuration loading, validation, and env substitution.
//!
//! Config files: `linkgate.toml`, `linkgate.yaml`, or `linkgate.json`,
//! searched in `./` then `~/.config/linkgate/`.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{config_dir, discover_and_load, load_config, load_or_discover},
    schema::{
        BroadcastConfig, DispatchConfig, HealthConfig, LinkgateConfig, ReconnectConfig,
        ServerConfig, SessionConfig, UploadsConfig, WebhookConfig,
    },
};
