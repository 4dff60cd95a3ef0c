//! Raw HTTP fetch mode
//!
//! Single GET with redirect following, no JavaScript, no browser. The
//! body cap is enforced on the byte stream so an oversized response is
//! abandoned mid-transfer instead of buffered.

use futures::StreamExt;
use log::debug;
use std::collections::BTreeMap;

use chrono::Utc;

use crate::atlas::records::{ErrorKind, ErrorPhase};
use crate::config::CrawlConfig;

use super::{
    FetchFailure, FetchTiming, FetchedPage, Fetcher, NetworkEntry, challenge::classify_challenge,
    classify_transport_error,
};

/// Maximum redirect hops before the fetch fails
const MAX_REDIRECT_HOPS: usize = 10;

/// Plain-HTTP fetcher
pub struct RawFetcher {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl RawFetcher {
    /// Build a fetcher from the crawl config
    pub fn new(config: &CrawlConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent().to_string())
            .timeout(config.request_timeout())
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECT_HOPS))
            .build()?;
        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes(),
        })
    }

    async fn fetch_inner(&self, url: &str, attempt: u32) -> Result<FetchedPage, FetchFailure> {
        let mut timing = FetchTiming::started_now();
        debug!("GET {url} (attempt {attempt})");

        let response = self.client.get(url).send().await.map_err(|e| {
            let kind = if e.is_redirect() {
                ErrorKind::HttpStatus
            } else {
                classify_transport_error(&e)
            };
            FetchFailure::new(kind, ErrorPhase::Fetch, e.to_string())
        })?;
        timing.response_at = Some(Utc::now());

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_lowercase(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                FetchFailure::new(
                    classify_transport_error(&e),
                    ErrorPhase::Fetch,
                    format!("body read failed: {e}"),
                )
            })?;
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(FetchFailure::new(
                    ErrorKind::BodyTooLarge,
                    ErrorPhase::Fetch,
                    format!(
                        "response exceeded {} byte cap at {url}",
                        self.max_body_bytes
                    ),
                ));
            }
            body.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&body).into_owned();

        // Challenge pages are archived as pages, whatever their status.
        let challenge = classify_challenge(status, &headers, &body);
        if challenge.is_none() && !(200..300).contains(&status) {
            return Err(FetchFailure::http_status(
                status,
                format!("HTTP {status} for {url}"),
            ));
        }

        let network_log = vec![NetworkEntry {
            url: final_url.clone(),
            resource_type: "document".to_string(),
            status: Some(status),
            bytes: Some(body.len() as u64),
        }];

        Ok(FetchedPage {
            final_url,
            status,
            headers,
            body,
            network_log,
            timing,
            challenge,
            audits: None,
        })
    }
}

impl Fetcher for RawFetcher {
    fn fetch(
        &self,
        url: &str,
        attempt: u32,
    ) -> impl std::future::Future<Output = Result<FetchedPage, FetchFailure>> + Send {
        self.fetch_inner(url, attempt)
    }
}
