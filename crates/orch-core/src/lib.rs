pub mod config;
pub mod error;
pub mod feed;
pub mod types;

pub use config::OrchConfig;
pub use error::{ConfigError, InvalidInput};
pub use feed::{load_mapping_feed, parse_mapping_feed};
pub use types::*;
