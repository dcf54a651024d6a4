//! Controller configuration loaded from `preview.toml`.

pub mod parser;
pub mod paths;
pub mod schema;

pub use parser::{load_config, parse_config_str, to_toml};
pub use paths::{default_config_path, default_work_dir};
pub use schema::{
    GateConfig, IdentityConfig, OperationConfig, PreviewConfig, RetryConfig, SiteConfig,
    StoreConfig, VerifyConfig,
};
