//! HTTP GET with backoff until the response satisfies a predicate
//!
//! Used for workloads exposed through load balancers, which take minutes to
//! get DNS and healthy targets after the deploy finishes.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::HOST;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{Error, Result};

/// Characters of the response body kept in failure messages
const BODY_SNIPPET_LEN: usize = 512;

/// A completed GET
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Body as text
    pub body: String,
}

impl HttpResponse {
    /// 2xx status
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Retrying GET probe
#[derive(Clone, Debug)]
pub struct HttpProbe {
    /// Target URL; `http://` is assumed when no scheme is given
    pub url: String,
    /// Request headers; `Host` overrides the request host
    pub headers: BTreeMap<String, String>,
    /// Total time allowed for the probe
    pub deadline: Duration,
    /// Wait after the first failed attempt; grows linearly per attempt
    pub initial_backoff: Duration,
    /// Upper bound for the wait between attempts
    pub max_backoff: Duration,
    /// Timeout of a single request
    pub request_timeout: Duration,
}

impl HttpProbe {
    /// Probe with the default ten minute deadline
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            deadline: Duration::from_secs(10 * 60),
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Add a request header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Total deadline
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Backoff bounds
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// URL with a scheme
    pub fn resolved_url(&self) -> String {
        if self.url.starts_with("http://") || self.url.starts_with("https://") {
            self.url.clone()
        } else {
            format!("http://{}", self.url)
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(attempt)
            .min(self.max_backoff)
    }

    /// GET until the response is 2xx and `predicate` accepts it
    ///
    /// Fails with the last status and a body snippet once the deadline passes.
    pub async fn wait_for<P>(&self, predicate: P) -> Result<HttpResponse>
    where
        P: Fn(&HttpResponse) -> bool,
    {
        let client = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| Error::probe(format!("failed to build HTTP client: {e}")))?;
        let url = self.resolved_url();
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let last = match self.get(&client, &url).await {
                Ok(resp) if resp.is_success() && predicate(&resp) => {
                    info!(url = %url, attempt, status = resp.status, "HTTP probe succeeded");
                    return Ok(resp);
                }
                Ok(resp) => format!(
                    "status {}, body {:?}",
                    resp.status,
                    snippet(&resp.body)
                ),
                Err(e) => format!("request failed: {e}"),
            };

            let delay = self.delay(attempt);
            if started.elapsed() + delay > self.deadline {
                return Err(Error::validation(format!(
                    "GET {url} not successful after {attempt} attempts in {:?}: last {last}",
                    self.deadline
                )));
            }
            debug!(url = %url, attempt, last = %last, delay_secs = delay.as_secs(), "HTTP probe retrying");
            tokio::time::sleep(delay).await;
        }
    }

    async fn get(&self, client: &reqwest::Client, url: &str) -> reqwest::Result<HttpResponse> {
        let mut request = client.get(url);
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case(HOST.as_str()) {
                request = request.header(HOST, value);
            } else {
                request = request.header(name.as_str(), value);
            }
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(BODY_SNIPPET_LEN).collect()
}
