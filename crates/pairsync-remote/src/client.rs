//! Document repository HTTP client
//!
//! Provides an authenticated HTTP client for the repository's REST and
//! automation endpoints. Handles credentials, URL construction, retries
//! on throttling and the mapping of HTTP statuses into [`RemoteError`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pairsync_remote::client::{Credentials, RemoteClient};
//!
//! # async fn example() -> Result<(), pairsync_core::ports::RemoteError> {
//! let client = RemoteClient::new(
//!     "https://docs.example.com/nuxeo",
//!     Credentials::Token("device-token".to_string()),
//! );
//! let info: serde_json::Value = client
//!     .operation_json("NuxeoDrive.GetTopLevelFolder", serde_json::json!({}))
//!     .await?;
//! println!("{}", info);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use pairsync_core::ports::RemoteError;

/// Header carrying the device token once the client is bound
pub const TOKEN_HEADER: &str = "X-Authentication-Token";

/// Header bounding the server transaction of a finalize operation
pub const TX_TIMEOUT_HEADER: &str = "Nuxeo-Transaction-Timeout";

/// Application name registered with device tokens
pub const APPLICATION_NAME: &str = "PairSync";

const AUTOMATION_PATH: &str = "/api/v1/automation";

/// Default retry-after duration when the header is missing
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Maximum number of in-place retries for 429 and 503 responses
const MAX_RETRIES: u32 = 3;

/// Longest `Retry-After` honored, in seconds
const MAX_RETRY_AFTER_SECS: u64 = 3600;

/// Longest error body kept in an error message
const MAX_ERROR_BODY: usize = 200;

// ============================================================================
// Credentials
// ============================================================================

/// How requests authenticate against the server
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Username and password, only used to acquire a token
    Basic { username: String, password: String },
    /// Device token sent in [`TOKEN_HEADER`]
    Token(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            Credentials::Token(_) => f.debug_tuple("Token").field(&"***").finish(),
        }
    }
}

// ============================================================================
// RemoteClient
// ============================================================================

/// HTTP client for the document repository
///
/// Wraps `reqwest::Client` with authentication and base URL construction.
/// Every call goes through [`RemoteClient::execute_with_retry`], which
/// retries throttled requests and turns error statuses into
/// [`RemoteError`] values.
pub struct RemoteClient {
    /// The underlying HTTP client
    client: Client,
    /// Server URL, e.g. `https://docs.example.com/nuxeo`
    base_url: String,
    credentials: Credentials,
    /// Identifier of this device when requesting tokens
    device_id: String,
}

impl RemoteClient {
    /// Creates a new client for the given server
    ///
    /// # Arguments
    /// * `server_url` - Base URL of the server (without trailing API path)
    /// * `credentials` - Basic credentials or a device token
    pub fn new(server_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            client: Client::new(),
            base_url: server_url.into().trim_end_matches('/').to_string(),
            credentials,
            device_id: default_device_id(),
        }
    }

    /// Creates a new client whose requests time out after `timeout`
    ///
    /// # Errors
    ///
    /// Returns `RemoteError::Network` if the HTTP client cannot be built
    /// (e.g. the TLS backend fails to initialize).
    pub fn with_timeout(
        server_url: impl Into<String>,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: server_url.into().trim_end_matches('/').to_string(),
            credentials,
            device_id: default_device_id(),
        })
    }

    /// Overrides the device id sent when requesting a token
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    /// Switches to token authentication (e.g., after a token was acquired)
    pub fn set_token(&mut self, token: impl Into<String>) {
        self.credentials = Credentials::Token(token.into());
        debug!("Switched RemoteClient to token authentication");
    }

    /// Returns the current credentials
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Returns the server base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the device id
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Builds an absolute URL from a server-relative path
    ///
    /// Absolute `http(s)://` URLs are returned unchanged.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Creates an authenticated request builder for the given method and path
    ///
    /// # Arguments
    /// * `method` - HTTP method (GET, POST, DELETE, etc.)
    /// * `path` - Path relative to the server URL (e.g., "/api/v1/upload/")
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.credentials {
            Credentials::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
            Credentials::Token(token) => builder.header(TOKEN_HEADER, token),
        }
    }

    /// Sends a request with in-place retries on 429 and 503 responses
    ///
    /// `build` is called once per attempt because request bodies cannot
    /// be replayed. On a throttled response the `Retry-After` header is
    /// honored (integer seconds or HTTP date); after [`MAX_RETRIES`]
    /// retries the status is mapped like any other error.
    ///
    /// # Arguments
    /// * `label` - Short description used in logs (operation id or path)
    /// * `build` - Produces the request to send
    pub async fn execute_with_retry<F>(&self, label: &str, build: F) -> Result<Response, RemoteError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let response = build().send().await.map_err(map_transport_error)?;
            let status = response.status();

            let throttled = status == StatusCode::TOO_MANY_REQUESTS
                || status == StatusCode::SERVICE_UNAVAILABLE;
            if throttled && attempt < MAX_RETRIES {
                let retry_after = retry_after_header(&response).unwrap_or(DEFAULT_RETRY_AFTER);
                info!(
                    label,
                    attempt,
                    status = status.as_u16(),
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Server is throttling, backing off"
                );
                tokio::time::sleep(retry_after).await;
                attempt += 1;
                continue;
            }

            if throttled {
                warn!(label, attempts = attempt + 1, "Retry limit exhausted");
            } else if attempt > 0 {
                info!(label, attempt, "Request succeeded after retry");
            }

            return check_status(response).await;
        }
    }

    /// Runs an automation operation and returns the raw response
    ///
    /// Sends `POST /api/v1/automation/{operation}` with `{"params": params}`.
    pub async fn operation(&self, operation: &str, params: Value) -> Result<Response, RemoteError> {
        let path = format!("{}/{}", AUTOMATION_PATH, operation);
        let body = serde_json::json!({ "params": params });
        debug!(operation, "Executing automation operation");
        self.execute_with_retry(operation, || self.request(Method::POST, &path).json(&body))
            .await
    }

    /// Runs an automation operation and decodes its JSON result
    pub async fn operation_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        params: Value,
    ) -> Result<T, RemoteError> {
        let response = self.operation(operation, params).await?;
        decode_json(operation, response).await
    }

    /// Runs an automation operation whose result may be `null` or empty
    pub async fn operation_optional<T: DeserializeOwned>(
        &self,
        operation: &str,
        params: Value,
    ) -> Result<Option<T>, RemoteError> {
        let response = self.operation(operation, params).await?;
        decode_optional_json(operation, response).await
    }

    /// Exchanges the basic credentials for a device token
    ///
    /// Calls `GET /authentication/token` with the application name and the
    /// device id. The server answers with the token as plain text.
    pub async fn acquire_token(&self) -> Result<String, RemoteError> {
        let device_description = format!("{} on {}", APPLICATION_NAME, std::env::consts::OS);
        let query = [
            ("applicationName", APPLICATION_NAME),
            ("deviceId", self.device_id.as_str()),
            ("deviceDescription", device_description.as_str()),
            ("permission", "ReadWrite"),
        ];
        let response = self
            .execute_with_retry("authentication/token", || {
                self.request(Method::GET, "/authentication/token").query(&query)
            })
            .await?;
        let token = response
            .text()
            .await
            .map_err(map_transport_error)?
            .trim()
            .to_string();
        if token.is_empty() {
            return Err(RemoteError::InvalidResponse(
                "Server returned an empty token".to_string(),
            ));
        }
        info!("Device token acquired");
        Ok(token)
    }
}

fn default_device_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{}-{}", APPLICATION_NAME.to_lowercase(), host)
}

// ============================================================================
// Response handling
// ============================================================================

/// Maps a transport failure into a [`RemoteError`]
pub fn map_transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Network(err.to_string())
    }
}

/// Passes successful responses through and maps error statuses
///
/// | Status | Error                            |
/// |--------|----------------------------------|
/// | 401    | `Unauthorized`                   |
/// | 403    | `Forbidden`                      |
/// | 404    | `NotFound`                       |
/// | 409    | `Conflict`                       |
/// | 429    | `TooManyRequests { retry_after }`|
/// | other  | `ServerError { status }`         |
pub async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = retry_after_header(&response).map(|d| d.as_secs());
    let url = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    let message = if body.trim().is_empty() {
        format!("{} {}", status, url)
    } else {
        truncate(body.trim(), MAX_ERROR_BODY)
    };

    Err(match status {
        StatusCode::UNAUTHORIZED => RemoteError::Unauthorized,
        StatusCode::FORBIDDEN => RemoteError::Forbidden(message),
        StatusCode::NOT_FOUND => RemoteError::NotFound(message),
        StatusCode::CONFLICT => RemoteError::Conflict(message),
        StatusCode::TOO_MANY_REQUESTS => RemoteError::TooManyRequests { retry_after },
        _ => RemoteError::ServerError {
            status: status.as_u16(),
            message,
        },
    })
}

/// Decodes a JSON body
pub async fn decode_json<T: DeserializeOwned>(
    label: &str,
    response: Response,
) -> Result<T, RemoteError> {
    let bytes = response.bytes().await.map_err(map_transport_error)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| RemoteError::InvalidResponse(format!("{}: {}", label, e)))
}

/// Decodes a JSON body where `null` or no content means "absent"
pub async fn decode_optional_json<T: DeserializeOwned>(
    label: &str,
    response: Response,
) -> Result<Option<T>, RemoteError> {
    if response.status() == StatusCode::NO_CONTENT {
        return Ok(None);
    }
    let bytes = response.bytes().await.map_err(map_transport_error)?;
    let text = String::from_utf8_lossy(&bytes);
    let text = text.trim();
    if text.is_empty() || text == "null" {
        return Ok(None);
    }
    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| RemoteError::InvalidResponse(format!("{}: {}", label, e)))
}

fn retry_after_header(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .map(|v| parse_retry_after(v, DEFAULT_RETRY_AFTER))
}

/// Parses a `Retry-After` value
///
/// Accepts integer seconds or an RFC 2822 date. Dates more than an hour
/// away and unparseable values fall back to `default`.
pub fn parse_retry_after(value: &str, default: Duration) -> Duration {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Duration::from_secs(seconds.min(MAX_RETRY_AFTER_SECS));
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value.trim()) {
        let now = chrono::Utc::now();
        let target = date.with_timezone(&chrono::Utc);
        if target <= now {
            return Duration::ZERO;
        }
        if let Some(secs) = (target - now)
            .num_seconds()
            .try_into()
            .ok()
            .filter(|&s: &u64| s <= MAX_RETRY_AFTER_SECS)
        {
            return Duration::from_secs(secs);
        }
    }

    warn!(value, "Could not parse Retry-After header, using default");
    default
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_client() -> RemoteClient {
        RemoteClient::new("http://localhost:8080/nuxeo/", Credentials::Token("tok".into()))
    }

    #[test]
    fn test_url_construction() {
        let client = token_client();
        assert_eq!(client.base_url(), "http://localhost:8080/nuxeo");
        assert_eq!(
            client.url("/api/v1/upload/"),
            "http://localhost:8080/nuxeo/api/v1/upload/"
        );
        assert_eq!(
            client.url("nxfile/default/doc/blobholder:0/joe.txt"),
            "http://localhost:8080/nuxeo/nxfile/default/doc/blobholder:0/joe.txt"
        );
        assert_eq!(client.url("https://cdn.example.com/b"), "https://cdn.example.com/b");
    }

    #[test]
    fn test_request_carries_token_header() {
        let client = token_client();
        let request = client.request(Method::GET, "/api/v1/upload/b1/0").build().unwrap();
        assert_eq!(request.headers().get(TOKEN_HEADER).unwrap(), "tok");
        assert!(request.headers().get("Authorization").is_none());
    }

    #[test]
    fn test_request_carries_basic_auth() {
        let client = RemoteClient::new(
            "http://localhost:8080/nuxeo",
            Credentials::Basic {
                username: "joe".into(),
                password: "secret".into(),
            },
        );
        let request = client.request(Method::GET, "/authentication/token").build().unwrap();
        let auth = request.headers().get("Authorization").unwrap().to_str().unwrap();
        assert!(auth.starts_with("Basic "));
        assert!(request.headers().get(TOKEN_HEADER).is_none());
    }

    #[test]
    fn test_set_token_switches_credentials() {
        let mut client = RemoteClient::new(
            "http://localhost",
            Credentials::Basic {
                username: "joe".into(),
                password: "secret".into(),
            },
        );
        client.set_token("abc");
        assert_eq!(client.credentials(), &Credentials::Token("abc".into()));
    }

    #[test]
    fn test_credentials_debug_hides_secrets() {
        let basic = Credentials::Basic {
            username: "joe".into(),
            password: "secret".into(),
        };
        let rendered = format!("{:?} {:?}", basic, Credentials::Token("tok-123".into()));
        assert!(rendered.contains("joe"));
        assert!(!rendered.contains("secret"));
        assert!(!rendered.contains("tok-123"));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let default = Duration::from_secs(5);
        assert_eq!(parse_retry_after("12", default), Duration::from_secs(12));
        assert_eq!(parse_retry_after(" 0 ", default), Duration::ZERO);
        assert_eq!(parse_retry_after("999999", default), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_retry_after_date_and_garbage() {
        let default = Duration::from_secs(5);
        let soon = (chrono::Utc::now() + chrono::Duration::seconds(30)).to_rfc2822();
        let parsed = parse_retry_after(&soon, default);
        assert!(parsed <= Duration::from_secs(30));
        assert!(parsed >= Duration::from_secs(28));

        let past = (chrono::Utc::now() - chrono::Duration::seconds(30)).to_rfc2822();
        assert_eq!(parse_retry_after(&past, default), Duration::ZERO);

        assert_eq!(parse_retry_after("soon", default), default);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééé", 3), "é...");
    }
}
