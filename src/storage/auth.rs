//! Shared Key authorization for the Blob and Queue services.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;

use super::StorageError;

type HmacSha256 = Hmac<Sha256>;

/// The parts of a request that take part in the signature.
pub(crate) struct CanonicalRequest<'a> {
    pub method: &'a str,
    pub content_length: usize,
    pub content_type: Option<&'a str>,
    /// `x-ms-*` headers.
    pub ms_headers: &'a [(&'a str, String)],
    /// URL path as sent on the wire, starting with `/`.
    pub path: &'a str,
    /// Decoded query parameters.
    pub query: &'a [(&'a str, String)],
}

pub(crate) fn string_to_sign(account: &str, request: &CanonicalRequest<'_>) -> String {
    // Content-Length is empty for zero-length bodies from version 2015-02-21 on.
    let content_length = if request.content_length == 0 {
        String::new()
    } else {
        request.content_length.to_string()
    };

    let mut out = String::new();
    for field in [
        request.method,
        "", // Content-Encoding
        "", // Content-Language
        content_length.as_str(),
        "", // Content-MD5
        request.content_type.unwrap_or(""),
        "", // Date, sent as x-ms-date instead
        "", // If-Modified-Since
        "", // If-Match
        "", // If-None-Match
        "", // If-Unmodified-Since
        "", // Range
    ] {
        out.push_str(field);
        out.push('\n');
    }

    let headers: BTreeMap<String, &str> = request
        .ms_headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim()))
        .collect();
    for (name, value) in headers {
        out.push_str(&name);
        out.push(':');
        out.push_str(value);
        out.push('\n');
    }

    out.push('/');
    out.push_str(account);
    out.push_str(request.path);

    let mut params: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for (name, value) in request.query {
        params
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.as_str());
    }
    for (name, mut values) in params {
        values.sort_unstable();
        out.push('\n');
        out.push_str(&name);
        out.push(':');
        out.push_str(&values.join(","));
    }

    out
}

/// Value for the `Authorization` header.
pub(crate) fn authorization(
    account: &str,
    key: &[u8],
    string_to_sign: &str,
) -> Result<String, StorageError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| StorageError::InvalidConnectionString(format!("unusable account key: {e}")))?;
    mac.update(string_to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());
    Ok(format!("SharedKey {account}:{signature}"))
}
