//! Crawl configuration
//!
//! Declarative description of one crawl session plus its typestate builder.

pub mod builder;
pub mod types;

pub use builder::CrawlConfigBuilder;
pub use types::{CrawlConfig, FetchMode};
