//! Small utility helpers shared across the crate.

use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};
use url::Url;

/// Return the first non-empty environment variable from `keys`, or `None`.
pub fn env_first(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| env::var(key).ok())
        .find(|value| !value.trim().is_empty())
}

/// Parse the first non-empty environment variable from `keys`, ignoring
/// values that fail to parse.
pub fn env_parse<T: FromStr>(keys: &[&str]) -> Option<T> {
    env_first(keys).and_then(|value| value.trim().parse().ok())
}

/// Parse an API base URL, prepending a scheme when it is missing and
/// guaranteeing a trailing slash so relative joins keep the path prefix.
pub fn parse_base_url(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else if raw.starts_with("localhost") || raw.starts_with("127.") {
        format!("http://{raw}")
    } else {
        format!("https://{raw}")
    };
    let with_slash = if with_scheme.ends_with('/') {
        with_scheme
    } else {
        format!("{with_scheme}/")
    };
    Url::parse(&with_slash).with_context(|| format!("parse api base url {raw:?}"))
}
