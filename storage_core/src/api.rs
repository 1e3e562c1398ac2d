//! A minimal JSON-over-HTTP client to the coordinator API (spec §6).
//!
//! Grounded on `shipcat_definitions::vault::Vault`: a thin wrapper around a
//! `reqwest` client, one error kind per category of HTTP failure, and plain
//! JSON bodies. Where `Vault` does authenticated GETs with a header token,
//! this client does unauthenticated POSTs with credentials embedded in the
//! JSON body, per spec §6.

use std::time::Duration;

use failure::ResultExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::AgentErrorKind;
use crate::Result;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A JSON-over-HTTP client bound to one coordinator base URL.
pub struct ApiClient {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<ApiClient> {
        let client = reqwest::blocking::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .with_context(|_| AgentErrorKind::TransportError(base_url.to_string(), "could not build HTTP client".into()))?;
        Ok(ApiClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// POST `body` as JSON to `<base_url>/<cmd>`, expecting a 2xx JSON
    /// response (spec §6). Non-2xx and non-JSON responses both become
    /// `ApiError`; connection failures and timeouts become `TransportError`.
    pub fn post<Req: Serialize, Resp: DeserializeOwned>(&self, cmd: &str, body: &Req) -> Result<Resp> {
        let url = format!("{}/{}", self.base_url, cmd);

        let response = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .with_context(|_| AgentErrorKind::TransportError(url.clone(), "request failed".into()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentErrorKind::ApiError(cmd.to_string(), format!("HTTP {}", status)).into());
        }

        response
            .json::<Resp>()
            .with_context(|_| AgentErrorKind::ApiError(cmd.to_string(), "non-JSON response".into()))
            .map_err(Into::into)
    }
}
