//! HTTP client for a running drafter server.

use anyhow::{bail, Context, Result};
use drafter_core::{Frame, ProposalRequest};
use eventsource_stream::Eventsource;
use futures::stream::{BoxStream, StreamExt};
use reqwest::{Client, StatusCode};

pub type FrameStream = BoxStream<'static, std::result::Result<Frame, String>>;

/// Result of asking the server to release a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    /// Server still considers the proposal running
    Running,
    Unknown,
}

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Open the proposal stream. Each SSE event becomes one frame; transport
    /// failures surface as `Err` items so the consumer can fail the session.
    pub async fn stream_proposal(&self, request: &ProposalRequest) -> Result<FrameStream> {
        let response = self
            .http
            .post(self.url("/api/proposals"))
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to reach drafter server at {}", self.base_url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Server rejected proposal ({}): {}", status, body);
        }

        let frames = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other))
            .eventsource()
            .map(|event| match event {
                Ok(event) => Ok(Frame::new(event.event, event.data)),
                Err(e) => Err(e.to_string()),
            });

        Ok(frames.boxed())
    }

    /// Returns false when the server does not know the proposal.
    pub async fn abort(&self, proposal_id: &str) -> Result<bool> {
        let response = self
            .http
            .post(self.url(&format!("/api/proposals/{}/abort", proposal_id)))
            .send()
            .await
            .with_context(|| format!("Failed to reach drafter server at {}", self.base_url))?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                bail!("Abort failed ({}): {}", status, body)
            }
        }
    }

    /// Release a settled proposal from the server's registry.
    pub async fn drain(&self, proposal_id: &str) -> Result<DrainOutcome> {
        let response = self
            .http
            .delete(self.url(&format!("/api/proposals/{}", proposal_id)))
            .send()
            .await
            .with_context(|| format!("Failed to reach drafter server at {}", self.base_url))?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(DrainOutcome::Drained),
            StatusCode::CONFLICT => Ok(DrainOutcome::Running),
            StatusCode::NOT_FOUND => Ok(DrainOutcome::Unknown),
            status => {
                let body = response.text().await.unwrap_or_default();
                bail!("Drain failed ({}): {}", status, body)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_drain_maps_status_codes() {
        let server = MockServer::start().await;
        for (id, status) in [("done", 204), ("busy", 409), ("gone", 404)] {
            Mock::given(method("DELETE"))
                .and(path(format!("/api/proposals/{}", id)))
                .respond_with(ResponseTemplate::new(status))
                .expect(1)
                .mount(&server)
                .await;
        }

        let client = ApiClient::new(format!("{}/", server.uri()));
        assert_eq!(client.drain("done").await.unwrap(), DrainOutcome::Drained);
        assert_eq!(client.drain("busy").await.unwrap(), DrainOutcome::Running);
        assert_eq!(client.drain("gone").await.unwrap(), DrainOutcome::Unknown);
    }

    #[tokio::test]
    async fn test_drain_server_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = ApiClient::new(server.uri()).drain("p-1").await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
