use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cm_auth::{ClientCredentialsTokenProvider, TokenProvider};
use serde::Deserialize;

use crate::error::ClientError;

pub const GET_JOB_URI: &str = "GET_JOB_URI";
pub const POST_RESULT_URI: &str = "POST_RESULT_URI";
pub const MODULE_AUTH_TOKEN: &str = "MODULE_AUTH_TOKEN";
pub const DEFAULT_CA_PATH: &str = "DEFAULT_CA_PATH";

pub const DEFAULT_GET_JOB_URI: &str = "http://127.0.0.1:8946/job";
pub const DEFAULT_POST_RESULT_URI: &str = "http://127.0.0.1:8946/results";
const DEFAULT_POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Resolved runtime settings for a module process.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleConfig {
    pub get_job_uri: String,
    pub post_result_uri: String,
    /// Token value (not its path), sent as the `Module-Auth-Token` header.
    pub module_auth_token: String,
    pub default_ca_path: Option<PathBuf>,
    pub poll_error_backoff: Duration,
    pub max_concurrency: Option<usize>,
    pub oauth: Option<OAuthConfig>,
}

/// Client-credentials settings. The resulting token is sent as
/// `Authorization: Bearer` on every job poll and result post.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OAuthConfig {
    pub hostname: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    #[serde(default = "default_get_job_uri")]
    get_job_uri: String,
    #[serde(default = "default_post_result_uri")]
    post_result_uri: String,
    module_auth_token_path: Option<PathBuf>,
    default_ca_path: Option<PathBuf>,
    #[serde(default = "default_poll_error_backoff_ms")]
    poll_error_backoff_ms: u64,
    max_concurrency: Option<usize>,
    oauth: Option<OAuthConfig>,
}

fn default_get_job_uri() -> String {
    DEFAULT_GET_JOB_URI.into()
}
fn default_post_result_uri() -> String {
    DEFAULT_POST_RESULT_URI.into()
}
fn default_poll_error_backoff_ms() -> u64 {
    DEFAULT_POLL_ERROR_BACKOFF.as_millis() as u64
}

impl ModuleConfig {
    /// Read the reserved environment variables of the hosting runtime.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a caller-supplied lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ClientError> {
        let token_path =
            lookup(MODULE_AUTH_TOKEN).ok_or(ClientError::MissingEnv(MODULE_AUTH_TOKEN))?;

        Ok(Self {
            get_job_uri: lookup(GET_JOB_URI).unwrap_or_else(default_get_job_uri),
            post_result_uri: lookup(POST_RESULT_URI).unwrap_or_else(default_post_result_uri),
            module_auth_token: read_token_file(Path::new(&token_path))?,
            default_ca_path: lookup(DEFAULT_CA_PATH).map(PathBuf::from),
            poll_error_backoff: DEFAULT_POLL_ERROR_BACKOFF,
            max_concurrency: None,
            oauth: None,
        })
    }

    /// Load from a TOML file. `module_auth_token_path` falls back to the
    /// `MODULE_AUTH_TOKEN` environment variable when omitted.
    pub fn from_file(path: &Path) -> Result<Self, ClientError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content, |key| std::env::var(key).ok())
    }

    fn from_toml(
        content: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ClientError> {
        let file: FileConfig = toml::from_str(content)
            .map_err(|e| ClientError::Config(format!("Failed to parse config: {e}")))?;

        let token_path = match file.module_auth_token_path {
            Some(path) => path,
            None => lookup(MODULE_AUTH_TOKEN)
                .map(PathBuf::from)
                .ok_or(ClientError::MissingEnv(MODULE_AUTH_TOKEN))?,
        };

        Ok(Self {
            get_job_uri: file.get_job_uri,
            post_result_uri: file.post_result_uri,
            module_auth_token: read_token_file(&token_path)?,
            default_ca_path: file.default_ca_path,
            poll_error_backoff: Duration::from_millis(file.poll_error_backoff_ms),
            max_concurrency: file.max_concurrency,
            oauth: file.oauth,
        })
    }

    /// Token provider for the `[oauth]` section, if one is configured.
    pub fn build_token_provider(&self) -> Result<Option<Arc<dyn TokenProvider>>, ClientError> {
        let Some(oauth) = &self.oauth else {
            return Ok(None);
        };

        let mut builder = ClientCredentialsTokenProvider::builder()
            .hostname(oauth.hostname.clone())
            .scopes(oauth.scopes.iter().cloned());
        if let Some(id) = &oauth.client_id {
            builder = builder.client_id(id.clone());
        }
        if let Some(secret) = &oauth.client_secret {
            builder = builder.client_secret(secret.clone());
        }

        Ok(Some(Arc::new(builder.build()?)))
    }
}

fn read_token_file(path: &Path) -> Result<String, ClientError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ClientError::TokenFile {
        path: path.to_path_buf(),
        source,
    })?;
    // Header values cannot carry the trailing newline most editors add.
    Ok(raw.trim_end().to_string())
}
