//! Infrastructure layer
//!
//! Configuration, logging and the concrete HTTP/HTML adapters behind the
//! crawling traits.

pub mod config;
pub mod html_extractor;
pub mod http_navigator;
pub mod logging;

pub use config::{ConfigError, HarvestConfig};
pub use html_extractor::HtmlExtractor;
pub use http_navigator::HttpNavigator;
pub use logging::{init_logging, init_logging_with_config};
