//! Shared value types threaded through the framework.

mod url;

pub use url::{Url, UrlParseError};
