use std::time::Duration;

use reqwest::{Client as HttpClient, ClientBuilder, RequestBuilder, Response, StatusCode};
use thiserror::Error;

use crate::models::{
    AccessTokenResponse, ApplyDiffRequest, ApplyDiffResponse, DatasiteStatesResponse,
    DiffRequest, DiffResponse, DownloadBulkRequest, EmailTokenRequest, EmailTokenResponse,
    ErrorDetail, FileMetadata, FileMetadataRequest, FileRequest, RelativePath,
    ValidateEmailTokenRequest,
};

pub const VERSION_HEADER: &str = "x-syftbox-version";
pub const RUNTIME_HEADER: &str = "x-syftbox-runtime";
pub const USER_HEADER: &str = "x-syftbox-user";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("payload too large: {0}")]
    TooLarge(String),
    #[error("hash mismatch: {0}")]
    HashMismatch(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("server error ({status}): {detail}")]
    Server { status: u16, detail: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("{0}")]
    Protocol(String),
}

impl ApiError {
    /// Transport failures and 5xx responses may succeed on the next tick;
    /// 4xx responses will not until the inputs change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Network(_) | ApiError::Server { .. })
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Typed HTTP client for the sync endpoints. Every request carries the
/// identifying headers and the bearer token.
#[derive(Clone)]
pub struct SyncClient {
    base: String,
    http: HttpClient,
    email: String,
    access_token: Option<String>,
}

impl SyncClient {
    pub fn new(base: &str, email: &str, access_token: Option<&str>) -> anyhow::Result<Self> {
        let http = ClientBuilder::new()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("syftbox-sync/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .build()?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
            email: email.to_string(),
            access_token: access_token.map(|t| t.to_string()),
        })
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    fn with_headers(&self, req: RequestBuilder) -> RequestBuilder {
        let mut req = req
            .header(VERSION_HEADER, env!("CARGO_PKG_VERSION"))
            .header(RUNTIME_HEADER, "rust")
            .header(USER_HEADER, &self.email);
        if let Some(token) = &self.access_token {
            req = req.bearer_auth(token);
        }
        req
    }

    pub async fn healthz(&self) -> ApiResult<()> {
        let url = format!("{}/healthz", self.base);
        let resp = self.with_headers(self.http.get(url)).send().await?;
        map_status(resp).await
    }

    /// Metadata for exactly one path. The wire call is a LIKE query; the
    /// exact match is selected client-side.
    pub async fn get_metadata(&self, path: &RelativePath) -> ApiResult<FileMetadata> {
        let url = format!("{}/sync/get_metadata", self.base);
        let body = FileMetadataRequest {
            path_like: path.as_str().to_string(),
        };
        let resp = self
            .with_headers(self.http.post(url))
            .json(&body)
            .send()
            .await?;
        let rows: Vec<FileMetadata> = map_json(resp).await?;
        rows.into_iter()
            .find(|m| &m.path == path)
            .ok_or_else(|| ApiError::NotFound(path.to_string()))
    }

    pub async fn get_datasite_states(&self, email: &str) -> ApiResult<DatasiteStatesResponse> {
        let url = format!("{}/sync/datasite_states", self.base);
        let resp = self
            .with_headers(self.http.get(url).query(&[("email", email)]))
            .send()
            .await?;
        map_json(resp).await
    }

    pub async fn get_diff(&self, path: &RelativePath, signature: &str) -> ApiResult<DiffResponse> {
        let url = format!("{}/sync/get_diff", self.base);
        let body = DiffRequest {
            path: path.clone(),
            signature: signature.to_string(),
        };
        let resp = self
            .with_headers(self.http.post(url))
            .json(&body)
            .send()
            .await?;
        map_json(resp).await
    }

    pub async fn apply_diff(
        &self,
        path: &RelativePath,
        diff: &[u8],
        expected_hash: &str,
    ) -> ApiResult<ApplyDiffResponse> {
        let url = format!("{}/sync/apply_diff", self.base);
        let body = ApplyDiffRequest {
            path: path.clone(),
            diff: crate::models::b85_encode(diff),
            expected_hash: expected_hash.to_string(),
        };
        let resp = self
            .with_headers(self.http.post(url))
            .json(&body)
            .send()
            .await?;
        map_json(resp).await
    }

    /// Upload full file bytes. The multipart filename carries the relative
    /// path the server stores it under.
    pub async fn create(&self, path: &RelativePath, data: Vec<u8>) -> ApiResult<()> {
        let url = format!("{}/sync/create", self.base);
        let part = reqwest::multipart::Part::bytes(data)
            .file_name(path.as_str().to_string())
            .mime_str("application/octet-stream")?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self
            .with_headers(self.http.post(url))
            .multipart(form)
            .send()
            .await?;
        map_status(resp).await
    }

    pub async fn delete(&self, path: &RelativePath) -> ApiResult<()> {
        let url = format!("{}/sync/delete", self.base);
        let body = FileRequest { path: path.clone() };
        let resp = self
            .with_headers(self.http.post(url))
            .json(&body)
            .send()
            .await?;
        map_status(resp).await
    }

    pub async fn download(&self, path: &RelativePath) -> ApiResult<Vec<u8>> {
        let url = format!("{}/sync/download/{}", self.base, path);
        let resp = self.with_headers(self.http.get(url)).send().await?;
        let resp = ensure_success(resp).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// Batch download; the response body is a zip archive of the readable
    /// subset of `paths`.
    pub async fn download_bulk(&self, paths: &[RelativePath]) -> ApiResult<Vec<u8>> {
        let url = format!("{}/sync/download_bulk", self.base);
        let body = DownloadBulkRequest {
            paths: paths.to_vec(),
        };
        let resp = self
            .with_headers(self.http.post(url))
            .json(&body)
            .send()
            .await?;
        let resp = ensure_success(resp).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    pub async fn request_email_token(&self, email: &str) -> ApiResult<String> {
        let url = format!("{}/auth/request_email_token", self.base);
        let body = EmailTokenRequest {
            email: email.to_string(),
        };
        let resp = self
            .with_headers(self.http.post(url))
            .json(&body)
            .send()
            .await?;
        let out: EmailTokenResponse = map_json(resp).await?;
        Ok(out.email_token)
    }

    pub async fn validate_email_token(&self, email: &str, email_token: &str) -> ApiResult<String> {
        let url = format!("{}/auth/validate_email_token", self.base);
        let body = ValidateEmailTokenRequest {
            email: email.to_string(),
            email_token: email_token.to_string(),
        };
        let resp = self
            .with_headers(self.http.post(url))
            .json(&body)
            .send()
            .await?;
        let out: AccessTokenResponse = map_json(resp).await?;
        Ok(out.access_token)
    }
}

async fn ensure_success(resp: Response) -> ApiResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let detail = error_detail(resp).await;
    Err(status_to_error(status, detail))
}

async fn map_json<T: for<'de> serde::Deserialize<'de>>(resp: Response) -> ApiResult<T> {
    let resp = ensure_success(resp).await?;
    let data = resp.bytes().await?;
    serde_json::from_slice(&data)
        .map_err(|e| ApiError::Protocol(format!("decode response body: {e}")))
}

async fn map_status(resp: Response) -> ApiResult<()> {
    ensure_success(resp).await.map(|_| ())
}

async fn error_detail(resp: Response) -> String {
    let raw = resp.bytes().await.unwrap_or_default();
    if let Ok(body) = serde_json::from_slice::<ErrorDetail>(&raw) {
        body.detail
    } else {
        String::from_utf8_lossy(&raw).to_string()
    }
}

fn status_to_error(status: StatusCode, detail: String) -> ApiError {
    match status {
        StatusCode::NOT_FOUND => ApiError::NotFound(detail),
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized(detail),
        StatusCode::FORBIDDEN => ApiError::PermissionDenied(detail),
        StatusCode::CONFLICT => ApiError::AlreadyExists(detail),
        StatusCode::PAYLOAD_TOO_LARGE => ApiError::TooLarge(detail),
        StatusCode::BAD_REQUEST => {
            if detail.contains("hash mismatch") {
                ApiError::HashMismatch(detail)
            } else {
                ApiError::BadRequest(detail)
            }
        }
        s => ApiError::Server {
            status: s.as_u16(),
            detail,
        },
    }
}
