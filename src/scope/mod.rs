//! URL Normalization, Scope & Robots Module
//!
//! Everything that decides whether a discovered URL belongs to the crawl:
//! deterministic normalization (the frontier dedup key), internal/external
//! classification against the seed set, and robots.txt admission.

pub mod normalizer;
pub mod robots;

pub use normalizer::{
    NormalizeError, NormalizeOptions, Scope, ScopeClassifier, normalize, registrable_domain,
};
pub use robots::{RobotsCache, RobotsVerdict};
