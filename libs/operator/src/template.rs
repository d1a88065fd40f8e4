//! Helpers used while rendering Dex manifests, and the renderer itself.
//!
//! Rendering is a pure function from a serializable value to YAML text.

use dexop_k8s_util::error::{Error, Result};
use dexop_k8s_util::names::safe_id;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;

/// Render a value as a YAML document.
pub fn render<T: Serialize>(values: &T) -> Result<String> {
    serde_yaml::to_string(values)
        .map_err(|e| Error::RenderError("failed to render template".to_string(), e))
}

/// Indent every line but the first one with `spaces` spaces.
pub fn indent(spaces: usize, v: &str) -> String {
    let pad = " ".repeat(spaces);
    v.replace('\n', &format!("\n{pad}"))
}

pub fn base64_encode(s: &str) -> String {
    STANDARD.encode(s)
}

pub fn base64_decode(s: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(s)
        .map_err(|e| Error::ParseError(format!("invalid base64 data: {e}")))?;
    String::from_utf8(bytes).map_err(|e| Error::Utf8Error("decoded data is not UTF-8".into(), e))
}

#[inline]
pub fn safe_yaml_id(s: &str) -> String {
    safe_id(s)
}

/// Last element of a slash separated path.
pub fn basename(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    trimmed
        .rsplit_once('/')
        .map_or(trimmed, |(_, base)| base)
        .to_string()
}

/// Every element of a slash separated path but the last one.
pub fn dirname(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        None if path.starts_with('/') => "/".to_string(),
        None => ".".to_string(),
        Some((dir, _)) => {
            let dir = dir.trim_end_matches('/');
            if dir.is_empty() {
                "/".to_string()
            } else {
                dir.to_string()
            }
        }
    }
}
