use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path as AxumPath, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use tokio::sync::Notify;

use crate::auth::UserStore;
use crate::config::DEFAULT_MAX_FILE_SIZE_MB;
use crate::db;
use crate::delta;
use crate::hash::{compute_signature, hash_bytes};
use crate::models::{
    b85_decode, b85_encode, ApplyDiffRequest, ApplyDiffResponse, DiffRequest, DiffResponse,
    DownloadBulkRequest, EmailTokenRequest, EmailTokenResponse, ErrorDetail, FileMetadata,
    FileMetadataRequest, FileRequest, RelativePath, ValidateEmailTokenRequest,
};
use crate::perms::{self, SyftPermission, PERMISSION_FILENAME};

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub data_dir: PathBuf,
    pub max_file_size_mb: u64,
}

impl ServerSettings {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            max_file_size_mb: DEFAULT_MAX_FILE_SIZE_MB,
        }
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshot")
    }

    pub fn file_db_path(&self) -> PathBuf {
        self.data_dir.join("file.db")
    }

    pub fn users_path(&self) -> PathBuf {
        self.data_dir.join("users.json")
    }

    fn temp_dir(&self) -> PathBuf {
        self.data_dir.join(".tmp")
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

/// Explicit context threaded into every handler: settings, the metadata
/// index handle and the user store. Constructed once at startup.
pub struct ServerContext {
    settings: ServerSettings,
    conn: Mutex<rusqlite::Connection>,
    users: Mutex<UserStore>,
}

pub type SharedContext = Arc<ServerContext>;

pub fn build_context(settings: ServerSettings) -> Result<SharedContext> {
    fs::create_dir_all(settings.snapshot_dir())
        .with_context(|| format!("create {}", settings.snapshot_dir().display()))?;
    fs::create_dir_all(settings.temp_dir())
        .with_context(|| format!("create {}", settings.temp_dir().display()))?;
    let conn = db::open(&settings.file_db_path())?;
    let users = UserStore::load_or_init(&settings.users_path())?;
    Ok(Arc::new(ServerContext {
        settings,
        conn: Mutex::new(conn),
        users: Mutex::new(users),
    }))
}

pub fn build_router(ctx: SharedContext) -> Router {
    let body_limit = ctx.settings.max_file_size_bytes() as usize + 1024 * 1024;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/request_email_token", post(request_email_token))
        .route("/auth/validate_email_token", post(validate_email_token))
        .route("/sync/get_metadata", post(get_metadata))
        .route("/sync/get_diff", post(get_diff))
        .route("/sync/apply_diff", post(apply_diff))
        .route("/sync/delete", post(delete_file))
        .route("/sync/create", post(create_file))
        .route("/sync/datasite_states", get(datasite_states))
        .route("/sync/download/*path", get(download))
        .route("/sync/download_bulk", post(download_bulk))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(ctx)
}

/// Bind and serve in a background task, returning the bound address.
pub async fn start(
    settings: ServerSettings,
    addr: &str,
    shutdown: Option<Arc<Notify>>,
) -> Result<SocketAddr> {
    let ctx = build_context(settings)?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    let bound = listener.local_addr()?;
    let app = build_router(ctx);

    tokio::spawn(async move {
        let result = if let Some(shutdown) = shutdown {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown.notified().await;
                })
                .await
        } else {
            axum::serve(listener, app).await
        };
        if let Err(e) = result {
            crate::logging::error(format!("sync server error: {e}"));
        }
    });

    crate::logging::info_kv("sync server started", &[("addr", &bound.to_string())]);
    Ok(bound)
}

struct ApiFailure(StatusCode, String);

impl IntoResponse for ApiFailure {
    fn into_response(self) -> axum::response::Response {
        (self.0, Json(ErrorDetail { detail: self.1 })).into_response()
    }
}

type HandlerResult<T> = Result<T, ApiFailure>;

fn bad_request(detail: impl Into<String>) -> ApiFailure {
    ApiFailure(StatusCode::BAD_REQUEST, detail.into())
}

fn unauthorized() -> ApiFailure {
    ApiFailure(StatusCode::UNAUTHORIZED, "invalid bearer token".to_string())
}

fn forbidden(detail: impl Into<String>) -> ApiFailure {
    ApiFailure(StatusCode::FORBIDDEN, detail.into())
}

fn not_found() -> ApiFailure {
    ApiFailure(StatusCode::NOT_FOUND, "path not found".to_string())
}

fn internal(err: anyhow::Error) -> ApiFailure {
    crate::logging::error(format!("internal server error: {err:#}"));
    ApiFailure(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal server error".to_string(),
    )
}

fn authorize(ctx: &ServerContext, headers: &HeaderMap) -> HandlerResult<String> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    ctx.users
        .lock()
        .unwrap()
        .email_for_access_token(token)
        .ok_or_else(unauthorized)
}

/// The nearest permission file at or above `path` in the snapshot decides
/// access; the datasite owner needs no grant.
fn can_read(ctx: &ServerContext, email: &str, path: &RelativePath) -> bool {
    path.datasite() == email
        || nearest_permission(ctx, path).is_some_and(|p| p.has_read(email))
}

fn can_write(ctx: &ServerContext, email: &str, path: &RelativePath) -> bool {
    path.datasite() == email
        || nearest_permission(ctx, path).is_some_and(|p| p.has_write(email))
}

fn nearest_permission(ctx: &ServerContext, path: &RelativePath) -> Option<SyftPermission> {
    let snapshot = ctx.settings.snapshot_dir();
    let mut dir = path.parent();
    while let Some(d) = dir {
        let perm_abs = d.to_fs_path(&snapshot).join(PERMISSION_FILENAME);
        if perm_abs.is_file() {
            return SyftPermission::load(&perm_abs).ok();
        }
        dir = d.parent();
    }
    None
}

fn write_temp(ctx: &ServerContext, data: &[u8]) -> HandlerResult<PathBuf> {
    let tmp = ctx
        .settings
        .temp_dir()
        .join(format!("upload-{}", uuid::Uuid::new_v4()));
    fs::write(&tmp, data)
        .with_context(|| format!("write {}", tmp.display()))
        .map_err(internal)?;
    Ok(tmp)
}

fn metadata_for_bytes(path: &RelativePath, data: &[u8]) -> FileMetadata {
    FileMetadata {
        path: path.clone(),
        hash: hash_bytes(data),
        signature: b85_encode(&compute_signature(data)),
        size: data.len() as u64,
        last_modified: Utc::now(),
    }
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn request_email_token(
    State(ctx): State<SharedContext>,
    Json(req): Json<EmailTokenRequest>,
) -> HandlerResult<Json<EmailTokenResponse>> {
    let email_token = ctx
        .users
        .lock()
        .unwrap()
        .issue_email_token(&req.email)
        .map_err(|e| bad_request(e.to_string()))?;
    // Dev-mode delivery: the token goes back in the response instead of an
    // email.
    Ok(Json(EmailTokenResponse { email_token }))
}

async fn validate_email_token(
    State(ctx): State<SharedContext>,
    Json(req): Json<ValidateEmailTokenRequest>,
) -> HandlerResult<Json<serde_json::Value>> {
    let access_token = ctx
        .users
        .lock()
        .unwrap()
        .validate_email_token(&req.email, &req.email_token)
        .map_err(internal)?
        .ok_or_else(|| bad_request("invalid email token"))?;
    Ok(Json(serde_json::json!({"access_token": access_token})))
}

async fn get_metadata(
    State(ctx): State<SharedContext>,
    headers: HeaderMap,
    Json(req): Json<FileMetadataRequest>,
) -> HandlerResult<Json<Vec<FileMetadata>>> {
    let email = authorize(&ctx, &headers)?;
    let rows = {
        let conn = ctx.conn.lock().unwrap();
        db::get_all_metadata(&conn, &req.path_like).map_err(internal)?
    };
    let readable = rows
        .into_iter()
        .filter(|m| can_read(&ctx, &email, &m.path))
        .collect();
    Ok(Json(readable))
}

async fn get_diff(
    State(ctx): State<SharedContext>,
    headers: HeaderMap,
    Json(req): Json<DiffRequest>,
) -> HandlerResult<Json<DiffResponse>> {
    let email = authorize(&ctx, &headers)?;
    let metadata = {
        let conn = ctx.conn.lock().unwrap();
        db::get_metadata_exact(&conn, &req.path).map_err(internal)?
    }
    .ok_or_else(not_found)?;
    if !can_read(&ctx, &email, &req.path) {
        return Err(forbidden(format!("{email} may not read {}", req.path)));
    }

    let abs = metadata.path.to_fs_path(&ctx.settings.snapshot_dir());
    let data = fs::read(&abs)
        .with_context(|| format!("read {}", abs.display()))
        .map_err(internal)?;

    let signature = b85_decode(&req.signature).map_err(|e| bad_request(e.to_string()))?;
    let diff =
        delta::diff(&signature, &data).map_err(|e| bad_request(e.to_string()))?;

    Ok(Json(DiffResponse {
        path: metadata.path,
        diff: b85_encode(&diff),
        hash: metadata.hash,
    }))
}

async fn apply_diff(
    State(ctx): State<SharedContext>,
    headers: HeaderMap,
    Json(req): Json<ApplyDiffRequest>,
) -> HandlerResult<Json<ApplyDiffResponse>> {
    let email = authorize(&ctx, &headers)?;
    let metadata = {
        let conn = ctx.conn.lock().unwrap();
        db::get_metadata_exact(&conn, &req.path).map_err(internal)?
    }
    .ok_or_else(not_found)?;
    if !can_write(&ctx, &email, &req.path) {
        return Err(forbidden(format!("{email} may not write {}", req.path)));
    }

    let abs = metadata.path.to_fs_path(&ctx.settings.snapshot_dir());
    let data = fs::read(&abs)
        .with_context(|| format!("read {}", abs.display()))
        .map_err(internal)?;

    let diff = req.diff_bytes().map_err(|e| bad_request(e.to_string()))?;
    let new_data = delta::apply(&data, &diff).map_err(|e| bad_request(e.to_string()))?;

    let new_metadata = metadata_for_bytes(&req.path, &new_data);
    if new_metadata.hash != req.expected_hash {
        return Err(bad_request("hash mismatch after applying diff"));
    }
    if new_metadata.size > ctx.settings.max_file_size_bytes() {
        return Err(ApiFailure(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("{} exceeds the size cap", req.path),
        ));
    }

    if perms::is_permission_path(&req.path) && SyftPermission::from_bytes(&new_data).is_err() {
        return Err(bad_request("invalid permission file"));
    }

    let tmp = write_temp(&ctx, &new_data)?;
    {
        let mut conn = ctx.conn.lock().unwrap();
        db::move_with_transaction(&mut conn, &ctx.settings.snapshot_dir(), &tmp, &new_metadata)
            .map_err(internal)?;
    }

    Ok(Json(ApplyDiffResponse {
        path: new_metadata.path,
        current_hash: new_metadata.hash,
        previous_hash: metadata.hash,
    }))
}

async fn delete_file(
    State(ctx): State<SharedContext>,
    headers: HeaderMap,
    Json(req): Json<FileRequest>,
) -> HandlerResult<Json<serde_json::Value>> {
    let email = authorize(&ctx, &headers)?;
    let metadata = {
        let conn = ctx.conn.lock().unwrap();
        db::get_metadata_exact(&conn, &req.path).map_err(internal)?
    }
    .ok_or_else(not_found)?;
    if !can_write(&ctx, &email, &metadata.path) {
        return Err(forbidden(format!("{email} may not write {}", req.path)));
    }

    {
        let mut conn = ctx.conn.lock().unwrap();
        db::delete_with_transaction(&mut conn, &ctx.settings.snapshot_dir(), &metadata.path)
            .map_err(internal)?;
    }
    Ok(Json(serde_json::json!({"status": "success"})))
}

async fn create_file(
    State(ctx): State<SharedContext>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> HandlerResult<Json<serde_json::Value>> {
    let email = authorize(&ctx, &headers)?;

    let mut upload: Option<(RelativePath, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        // The target path travels as the uploaded filename, validated like
        // any other relative path.
        let filename = field
            .file_name()
            .ok_or_else(|| bad_request("upload is missing a filename"))?
            .to_string();
        let path = RelativePath::new(&filename).map_err(|e| bad_request(e.to_string()))?;
        let data = field
            .bytes()
            .await
            .map_err(|e| bad_request(e.to_string()))?
            .to_vec();
        upload = Some((path, data));
        break;
    }
    let (path, data) = upload.ok_or_else(|| bad_request("upload is missing a file field"))?;

    let exists = {
        let conn = ctx.conn.lock().unwrap();
        db::get_metadata_exact(&conn, &path).map_err(internal)?.is_some()
    };
    if exists {
        return Err(ApiFailure(
            StatusCode::CONFLICT,
            format!("{path} already exists, modify it instead"),
        ));
    }
    if !can_write(&ctx, &email, &path) {
        return Err(forbidden(format!("{email} may not write {path}")));
    }
    if data.len() as u64 > ctx.settings.max_file_size_bytes() {
        return Err(ApiFailure(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("{path} exceeds the size cap"),
        ));
    }
    if perms::is_permission_path(&path) && SyftPermission::from_bytes(&data).is_err() {
        return Err(bad_request("invalid permission file"));
    }

    let metadata = metadata_for_bytes(&path, &data);
    let tmp = write_temp(&ctx, &data)?;
    {
        let mut conn = ctx.conn.lock().unwrap();
        db::move_with_transaction(&mut conn, &ctx.settings.snapshot_dir(), &tmp, &metadata)
            .map_err(internal)?;
    }
    Ok(Json(serde_json::json!({"status": "success"})))
}

async fn datasite_states(
    State(ctx): State<SharedContext>,
    headers: HeaderMap,
) -> HandlerResult<Json<HashMap<String, Vec<FileMetadata>>>> {
    let email = authorize(&ctx, &headers)?;
    let rows = {
        let conn = ctx.conn.lock().unwrap();
        db::all_metadata(&conn).map_err(internal)?
    };

    let mut out: HashMap<String, Vec<FileMetadata>> = HashMap::new();
    for metadata in rows {
        if !can_read(&ctx, &email, &metadata.path) {
            continue;
        }
        out.entry(metadata.path.datasite().to_string())
            .or_default()
            .push(metadata);
    }
    Ok(Json(out))
}

async fn download(
    State(ctx): State<SharedContext>,
    headers: HeaderMap,
    AxumPath(raw_path): AxumPath<String>,
) -> HandlerResult<impl IntoResponse> {
    let email = authorize(&ctx, &headers)?;
    let path =
        RelativePath::new(raw_path.trim_start_matches('/')).map_err(|e| bad_request(e.to_string()))?;

    let metadata = {
        let conn = ctx.conn.lock().unwrap();
        db::get_metadata_exact(&conn, &path).map_err(internal)?
    }
    .ok_or_else(not_found)?;
    if !can_read(&ctx, &email, &path) {
        return Err(forbidden(format!("{email} may not read {path}")));
    }

    let abs = metadata.path.to_fs_path(&ctx.settings.snapshot_dir());
    let data = fs::read(&abs)
        .with_context(|| format!("read {}", abs.display()))
        .map_err(internal)?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        data,
    ))
}

async fn download_bulk(
    State(ctx): State<SharedContext>,
    headers: HeaderMap,
    Json(req): Json<DownloadBulkRequest>,
) -> HandlerResult<impl IntoResponse> {
    let email = authorize(&ctx, &headers)?;
    let snapshot = ctx.settings.snapshot_dir();

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for path in &req.paths {
        if !can_read(&ctx, &email, path) {
            crate::logging::warn(format!("bulk download: {email} may not read {path}"));
            continue;
        }
        let exists = {
            let conn = ctx.conn.lock().unwrap();
            db::get_metadata_exact(&conn, path).map_err(internal)?.is_some()
        };
        if !exists {
            continue;
        }
        let abs = path.to_fs_path(&snapshot);
        let data = match fs::read(&abs) {
            Ok(data) => data,
            Err(e) => {
                crate::logging::warn(format!("bulk download: skipping {path}: {e}"));
                continue;
            }
        };
        writer
            .start_file(path.as_str(), options)
            .context("zip entry")
            .map_err(internal)?;
        std::io::Write::write_all(&mut writer, &data)
            .context("zip write")
            .map_err(internal)?;
    }
    let archive = writer
        .finish()
        .context("finish zip")
        .map_err(internal)?
        .into_inner();

    Ok(([(header::CONTENT_TYPE, "application/zip")], archive))
}
