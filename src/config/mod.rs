//! Configuration loading and management.

mod file;
mod paths;
mod types;
mod validate;

pub use file::{load_config_file, load_default_config, save_config};
pub use paths::{config_dir, config_file_path, default_registry_dir};
pub use types::{
    Config, DedupConfig, ExtractorConfig, ExtractorKind, MatchingConfig, RegistryConfig,
    SeasonPeriod, SeasonalConfig, WorkerConfig,
};
pub use validate::validate_config;
