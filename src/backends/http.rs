//! Shared `ureq` plumbing: agents, URL building, failure classification.

use std::io::{Read, Write};
use std::time::Duration;

use serde_json::Value;

use crate::backends::MediaFetcher;
use crate::error::UpstreamError;

/// Builds an agent whose reads and writes time out independently of each other call.
pub fn build_agent(connect_timeout: Duration, io_timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(connect_timeout)
        .timeout_read(io_timeout)
        .timeout_write(io_timeout)
        .build()
}

/// Appends url-encoded query parameters to `base`.
pub fn request_url(base: &str, params: &[(&str, &str)]) -> String {
    let mut url = base.trim().to_string();
    if params.is_empty() {
        return url;
    }

    url.push(if url.contains('?') { '&' } else { '?' });
    for (index, (key, value)) in params.iter().enumerate() {
        if index > 0 {
            url.push('&');
        }
        url.push_str(urlencoding::encode(key).as_ref());
        url.push('=');
        url.push_str(urlencoding::encode(value).as_ref());
    }
    url
}

pub fn classify_ureq_failure(error: ureq::Error) -> UpstreamError {
    match error {
        ureq::Error::Status(429, _) => UpstreamError::RateLimited { attempts: 1 },
        ureq::Error::Status(code, _) => UpstreamError::Status(code),
        ureq::Error::Transport(transport) => {
            let message = transport.to_string();
            let lowered = message.to_ascii_lowercase();
            if lowered.contains("timed out") || lowered.contains("timeout") {
                UpstreamError::Timeout(message)
            } else {
                UpstreamError::Transport(message)
            }
        }
    }
}

fn classify_io_failure(error: std::io::Error) -> UpstreamError {
    let message = error.to_string();
    if matches!(
        error.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    ) || message.to_ascii_lowercase().contains("timed out")
    {
        UpstreamError::Timeout(message)
    } else {
        UpstreamError::Transport(message)
    }
}

/// Issues one GET and decodes the body as JSON. No retries.
pub fn get_json_once(
    agent: &ureq::Agent,
    url: &str,
    user_agent: &str,
    timeout: Duration,
) -> Result<Value, UpstreamError> {
    let response = agent
        .get(url)
        .set("User-Agent", user_agent)
        .set("Accept", "application/json")
        .timeout(timeout)
        .call()
        .map_err(classify_ureq_failure)?;
    if response.status() != 200 {
        return Err(UpstreamError::Status(response.status()));
    }
    let mut body = String::new();
    response
        .into_reader()
        .read_to_string(&mut body)
        .map_err(classify_io_failure)?;
    serde_json::from_str(&body).map_err(|error| UpstreamError::Decode(error.to_string()))
}

/// Downloads media over HTTP, streaming the body straight into the sink.
pub struct HttpMediaFetcher {
    http_client: ureq::Agent,
    user_agent: String,
    timeout: Duration,
}

impl HttpMediaFetcher {
    pub fn new(connect_timeout: Duration, timeout: Duration, user_agent: &str) -> Self {
        Self {
            http_client: build_agent(connect_timeout, timeout),
            user_agent: user_agent.to_string(),
            timeout,
        }
    }
}

impl MediaFetcher for HttpMediaFetcher {
    fn fetch_to(&self, url: &str, sink: &mut dyn Write) -> Result<u64, UpstreamError> {
        let response = self
            .http_client
            .get(url)
            .set("User-Agent", &self.user_agent)
            .timeout(self.timeout)
            .call()
            .map_err(classify_ureq_failure)?;
        if response.status() != 200 {
            return Err(UpstreamError::Status(response.status()));
        }
        let mut reader = response.into_reader();
        std::io::copy(&mut reader, sink).map_err(classify_io_failure)
    }
}
