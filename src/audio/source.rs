//! Clip URL resolution

use chrono::Utc;
use reqwest::Url;

use crate::error::{AudioError, Result};

/// Resolve a clip address for loading.
///
/// Absolute URLs pass through untouched. Anything else is joined onto
/// `origin`, and gets a `t=<millis>` query when `cache_bust` is set so a
/// re-uploaded clip at the same path is fetched again.
pub fn resolve_source_url(raw: &str, origin: &str, cache_bust: bool) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AudioError::LoadFailure("empty audio source".to_string()));
    }

    if let Ok(url) = Url::parse(raw) {
        return Ok(url.to_string());
    }

    let base = Url::parse(origin)
        .map_err(|e| AudioError::LoadFailure(format!("invalid backend origin {}: {}", origin, e)))?;
    let mut url = base
        .join(raw)
        .map_err(|e| AudioError::LoadFailure(format!("invalid audio path {}: {}", raw, e)))?;

    if cache_bust {
        url.query_pairs_mut()
            .append_pair("t", &Utc::now().timestamp_millis().to_string());
    }

    Ok(url.to_string())
}
