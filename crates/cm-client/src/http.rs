use std::sync::Arc;
use std::time::Duration;

use cm_auth::TokenProvider;
use cm_core::{Job, JobSource, SourceError};
use futures::future::BoxFuture;
use reqwest::{StatusCode, Url};
use reqwest::header::CONTENT_TYPE;

use crate::config::ModuleConfig;
use crate::error::ClientError;

pub const MODULE_AUTH_TOKEN_HEADER: &str = "Module-Auth-Token";

/// Job source backed by the hosting runtime's HTTP endpoints.
///
/// `get_job` never fails: bad statuses and connection errors are logged and
/// followed by a short sleep so the engine does not spin against a
/// misbehaving runtime.
pub struct HttpJobSource {
    http: reqwest::Client,
    get_job_uri: String,
    post_result_uri: Url,
    module_auth_token: String,
    poll_error_backoff: Duration,
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl std::fmt::Debug for HttpJobSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpJobSource")
            .field("get_job_uri", &self.get_job_uri)
            .field("post_result_uri", &self.post_result_uri)
            .field("poll_error_backoff", &self.poll_error_backoff)
            .field("bearer", &self.token_provider.is_some())
            .finish_non_exhaustive()
    }
}

impl HttpJobSource {
    pub fn new(config: &ModuleConfig) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder();
        if let Some(path) = &config.default_ca_path {
            let pem = std::fs::read(path).map_err(|e| ClientError::CaCertificate {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            let cert =
                reqwest::Certificate::from_pem(&pem).map_err(|e| ClientError::CaCertificate {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| ClientError::Http(e.to_string()))?;

        let post_result_uri = Url::parse(&config.post_result_uri)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| {
                ClientError::Config(format!(
                    "invalid post result URI: {}",
                    config.post_result_uri
                ))
            })?;

        Ok(Self {
            http,
            get_job_uri: config.get_job_uri.clone(),
            post_result_uri,
            module_auth_token: config.module_auth_token.clone(),
            poll_error_backoff: config.poll_error_backoff,
            token_provider: None,
        })
    }

    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(&ModuleConfig::from_env()?)
    }

    /// Attach `Authorization: Bearer <token>` to every request.
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    pub fn with_poll_error_backoff(mut self, backoff: Duration) -> Self {
        self.poll_error_backoff = backoff;
        self
    }

    /// `<post_result_uri>/<job_id>`, with the id percent-encoded as a single
    /// path segment.
    fn result_url(&self, job_id: &str) -> Url {
        let mut url = self.post_result_uri.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(job_id);
        }
        url
    }

    async fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header(MODULE_AUTH_TOKEN_HEADER, &self.module_auth_token);
        let Some(provider) = &self.token_provider else {
            return request;
        };
        match provider.token().await {
            Ok(token) => request.bearer_auth(token),
            Err(e) => {
                tracing::warn!(error = %e, "No bearer token available, sending request without it");
                request
            }
        }
    }

    async fn poll(&self) -> Option<Job> {
        let request = self.authorize(self.http.get(&self.get_job_uri)).await;

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(url = %self.get_job_uri, error = %e, "Connection error while requesting job");
                tokio::time::sleep(self.poll_error_backoff).await;
                return None;
            }
        };

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NO_CONTENT => return None,
            status => {
                tracing::error!(url = %self.get_job_uri, status = %status, "Failed to request job");
                tokio::time::sleep(self.poll_error_backoff).await;
                return None;
            }
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read job body");
                return None;
            }
        };

        match Job::from_json(&body) {
            Ok(job) => Some(job),
            Err(e) => {
                tracing::error!(error = %e, body_len = body.len(), "Failed to parse job");
                None
            }
        }
    }
}

impl JobSource for HttpJobSource {
    fn get_job(&self) -> BoxFuture<'_, Result<Option<Job>, SourceError>> {
        Box::pin(async move { Ok(self.poll().await) })
    }

    fn post_result<'a>(
        &'a self,
        job_id: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), SourceError>> {
        Box::pin(async move {
            let url = self.result_url(job_id);
            let request = self
                .authorize(self.http.post(url.clone()))
                .await
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(payload);

            let response = request
                .send()
                .await
                .map_err(|e| SourceError::Transport(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(SourceError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            tracing::debug!(job_id, status = %status, "Result posted");
            Ok(())
        })
    }
}
