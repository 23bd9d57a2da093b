// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! REST lookup of problem titles and tags once the room names its problems.

use std::sync::Once;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

static CRYPTO: Once = Once::new();

/// Install the rustls crypto provider (needed for reqwest even on plain HTTP).
pub fn install_crypto_provider() {
    CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemMetadata {
    pub problem_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// HTTP client for the problem metadata endpoint.
pub struct MetadataClient {
    base_url: String,
    auth_token: Option<String>,
    client: Client,
}

impl MetadataClient {
    pub fn new(base_url: String, auth_token: Option<String>) -> Self {
        install_crypto_provider();
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { base_url: base_url.trim_end_matches('/').to_owned(), auth_token, client }
    }

    /// `GET /problems/bulk/metadata?problemIds=a&problemIds=b`.
    pub async fn bulk_problem_metadata(
        &self,
        problem_ids: &[String],
    ) -> anyhow::Result<Vec<ProblemMetadata>> {
        if problem_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut url = reqwest::Url::parse(&format!("{}/problems/bulk/metadata", self.base_url))?;
        {
            let mut query = url.query_pairs_mut();
            for id in problem_ids {
                query.append_pair("problemIds", id);
            }
        }

        let mut req = self.client.get(url).header("X-Requires-Auth", "false");
        if let Some(ref token) = self.auth_token {
            req = req.bearer_auth(token);
        }
        let body: Value = req.send().await?.error_for_status()?.json().await?;
        parse_bulk_body(&body)
    }
}

/// Pull `payload.bulkProblemMetadata` out of the response body.
pub fn parse_bulk_body(body: &Value) -> anyhow::Result<Vec<ProblemMetadata>> {
    let list = body
        .pointer("/payload/bulkProblemMetadata")
        .ok_or_else(|| anyhow::anyhow!("response has no payload.bulkProblemMetadata"))?;
    Ok(serde_json::from_value(list.clone())?)
}

#[cfg(test)]
#[path = "metadata_tests.rs"]
mod tests;
