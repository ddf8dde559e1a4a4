//! Fetch and search collaborators used by the research stage.
//!
//! This crate provides:
//! - [`Fetcher`] / [`HttpFetcher`]: retrieve a page and extract its visible text
//! - [`SearchProvider`] / [`SearxSearch`] / [`RetryingSearch`]: ranked result URLs

pub mod fetcher;
pub mod search;

pub use fetcher::{FetchResponse, Fetcher, HttpFetcher, extract_text, extract_title};
pub use search::{RetryingSearch, SearchProvider, SearxSearch};
