//! Documentation provider over HTTP: `GET {base}/docs/{framework}?q={query}`
//! returning the documentation as plain text.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use toolflow_core::ServiceError;

use crate::collaborators::DocumentationProvider;

#[derive(Debug, Clone)]
pub struct HttpDocumentationProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDocumentationProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Unavailable(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, framework: &str) -> String {
        format!("{}/docs/{}", self.base_url, framework)
    }
}

fn status_error(status: StatusCode, framework: &str) -> ServiceError {
    let msg = format!("{} docs: HTTP {}", framework, status.as_u16());
    match status {
        StatusCode::TOO_MANY_REQUESTS => ServiceError::RateLimited(msg),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ServiceError::Timeout(msg),
        s if s.is_server_error() => ServiceError::Unavailable(msg),
        _ => ServiceError::Rejected(msg),
    }
}

fn transport_error(err: reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        ServiceError::Timeout(err.to_string())
    } else {
        ServiceError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl DocumentationProvider for HttpDocumentationProvider {
    async fn query(&self, framework: &str, query: &str) -> Result<String, ServiceError> {
        let response = self
            .client
            .get(self.url_for(framework))
            .query(&[("q", query)])
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, framework));
        }
        response.text().await.map_err(transport_error)
    }
}
