// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;
use reqwest::header::{HeaderMap, HeaderValue, InvalidHeaderValue, AUTHORIZATION, CONTENT_TYPE};
use std::error::Error;

pub const REPORTER_VERSION_HEADER: &str = "x-reporter-version";
/// Version of this agent build, sent with every collector request.
pub const REPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Builds a reqwest client with optional proxy configuration and timeout.
pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    Ok(builder.build()?)
}

/// Headers every collector request carries: bearer auth, JSON body and the reporter version.
pub fn collector_headers(api_key: &str) -> Result<HeaderMap, InvalidHeaderValue> {
    let mut headers = HeaderMap::new();
    let mut authorization = HeaderValue::from_str(&format!("Bearer {api_key}"))?;
    authorization.set_sensitive(true);
    headers.insert(AUTHORIZATION, authorization);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        REPORTER_VERSION_HEADER,
        HeaderValue::from_static(REPORTER_VERSION),
    );
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_headers() {
        let headers = collector_headers("testApiKey").unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer testApiKey");
        assert!(headers[AUTHORIZATION].is_sensitive());
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert_eq!(headers[REPORTER_VERSION_HEADER], REPORTER_VERSION);
    }

    #[test]
    fn test_collector_headers_reject_control_characters() {
        assert!(collector_headers("bad\nkey").is_err());
    }

    #[test]
    fn test_build_client() {
        assert!(build_client(None, Duration::from_secs(1)).is_ok());
        assert!(build_client(Some("http://127.0.0.1:3128"), Duration::from_secs(1)).is_ok());
    }
}
