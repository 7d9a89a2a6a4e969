//! Compile configuration: serde model, YAML parsing and semantic checks.

pub mod parser;
pub mod types;
pub mod validator;

pub use parser::{parse_config, parse_config_str};
pub use types::CompileConfig;
pub use validator::validate_config;
