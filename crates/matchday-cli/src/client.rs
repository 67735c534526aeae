//! Blocking HTTP client for a running matchday server.

use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;

pub struct Client {
    base: String,
    agent: ureq::Agent,
}

impl Client {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        let agent = ureq::AgentBuilder::new()
            .timeout(std::time::Duration::from_secs(120))
            .build();
        Self { base, agent }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.base);
        self.read(&url, self.agent.get(&url).call())
    }

    pub fn post<T: DeserializeOwned>(&self, path: &str, body: Option<serde_json::Value>) -> Result<T> {
        let url = format!("{}{path}", self.base);
        let req = self.agent.post(&url);
        let resp = match body {
            Some(body) => req
                .set("content-type", "application/json")
                .send_string(&body.to_string()),
            None => req.call(),
        };
        self.read(&url, resp)
    }

    fn read<T: DeserializeOwned>(
        &self,
        url: &str,
        resp: std::result::Result<ureq::Response, ureq::Error>,
    ) -> Result<T> {
        match resp {
            Ok(r) => {
                let text = r.into_string().context("failed to read response body")?;
                serde_json::from_str(&text).with_context(|| format!("unexpected response from {url}"))
            }
            Err(ureq::Error::Status(code, r)) => {
                let text = r.into_string().unwrap_or_default();
                bail!("{url} returned {code}: {}", error_message(&text))
            }
            Err(e) => Err(anyhow!("cannot reach {}: {e}", self.base)),
        }
    }
}

/// The server's `{"error": ...}` message, or the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_prefers_error_field() {
        assert_eq!(error_message(r#"{"error":"not found"}"#), "not found");
        assert_eq!(error_message("gateway timeout\n"), "gateway timeout");
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        assert_eq!(Client::new("http://localhost:7700/").base(), "http://localhost:7700");
    }
}
