#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axum::{
    body::Bytes,
    extract::State,
    http::{
        header::{CONTENT_TYPE, USER_AGENT},
        HeaderMap, HeaderValue, Method, StatusCode,
    },
    routing::{get, post, MethodRouter},
    Json, Router,
};
use patlab_kernel_contracts::submission::{SubmissionAck, SubmissionPayload};
use patlab_storage::submissions::{
    default_db_path, SchemaProfile, StorageError, SubmissionRowInput, SubmissionStore,
};
use serde_json::Value;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

pub mod error;

use error::AppError;

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";
pub const SAVE_DATA_PATH: &str = "/api/save_data";
pub const SAVE_DATA_LEGACY_PATH: &str = "/save_data.php";
pub const HEALTH_PATH: &str = "/healthz";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    pub bind: String,
    pub db_path: PathBuf,
    pub allowed_origins: Vec<String>,
}

impl AdapterConfig {
    pub fn from_env() -> Self {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    pub fn from_env_var_map<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let bind = non_empty("PATLAB_HTTP_BIND").unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string());
        let db_path = non_empty("PATLAB_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_db_path(lookup("HOME")));
        let allowed_origins = non_empty("PATLAB_ALLOWED_ORIGINS")
            .map(|raw| parse_allowed_origins(&raw))
            .unwrap_or_default();
        Self {
            bind,
            db_path,
            allowed_origins,
        }
    }
}

/// Comma-separated exact origins; a trailing slash is dropped since browsers never send one.
pub fn parse_allowed_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|o| o.trim().trim_end_matches('/').to_string())
        .filter(|o| !o.is_empty())
        .collect()
}

pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring allowed origin that is not a valid header value");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub schema: String,
    pub rows: u64,
}

#[derive(Clone)]
pub struct AdapterRuntime {
    store: Arc<Mutex<SubmissionStore>>,
}

impl AdapterRuntime {
    pub fn new(store: SubmissionStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    pub fn open(config: &AdapterConfig) -> Result<Self, StorageError> {
        let store = SubmissionStore::open(&config.db_path)?;
        info!(
            db_path = %config.db_path.display(),
            schema = ?store.schema(),
            "opened submission store"
        );
        Ok(Self::new(store))
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Ok(Self::new(SubmissionStore::open_in_memory()?))
    }

    fn lock_store(&self) -> Result<std::sync::MutexGuard<'_, SubmissionStore>, AppError> {
        self.store
            .lock()
            .map_err(|_| AppError::Internal("adapter store lock poisoned".to_string()))
    }

    /// Shape of the live table, re-read so an out-of-band migration shows up.
    pub fn schema(&self) -> Result<SchemaProfile, AppError> {
        Ok(self.lock_store()?.refresh_schema()?)
    }

    /// Validates a raw request body and inserts one row. `header_user_agent` is used when
    /// the body carries no `userAgent`.
    pub fn save_submission(
        &self,
        body: &[u8],
        header_user_agent: Option<String>,
    ) -> Result<SubmissionAck, AppError> {
        let value: Value = serde_json::from_slice(body).map_err(|_| AppError::InvalidJson)?;
        let payload = SubmissionPayload::from_wire(&value)?;
        let input = SubmissionRowInput::from_payload(payload, header_user_agent);
        let participant_id = input.participant_id.as_str().to_string();
        let id = self.lock_store()?.insert_submission(input)?;
        info!(id, participant_id = %participant_id, "submission saved");
        Ok(SubmissionAck::saved(id))
    }

    pub fn health_report(&self) -> Result<AdapterHealthResponse, AppError> {
        let mut store = self.lock_store()?;
        let schema = if store.refresh_schema()?.is_extended() {
            "extended"
        } else {
            "legacy"
        };
        Ok(AdapterHealthResponse {
            status: "ok".to_string(),
            schema: schema.to_string(),
            rows: store.row_count()?,
        })
    }
}

fn save_data_route() -> MethodRouter<AdapterRuntime> {
    post(save_data)
        .options(preflight)
        .fallback(method_not_allowed)
}

pub fn build_router(runtime: AdapterRuntime, allowed_origins: &[String]) -> Router {
    Router::new()
        .route(SAVE_DATA_PATH, save_data_route())
        .route(SAVE_DATA_LEGACY_PATH, save_data_route())
        .route(HEALTH_PATH, get(healthz))
        .layer(cors_layer(allowed_origins))
        .with_state(runtime)
}

async fn save_data(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SubmissionAck>, AppError> {
    let header_user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let ack = runtime.save_submission(&body, header_user_agent)?;
    Ok(Json(ack))
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

async fn method_not_allowed() -> AppError {
    AppError::MethodNotAllowed
}

async fn healthz(
    State(runtime): State<AdapterRuntime>,
) -> Result<Json<AdapterHealthResponse>, AppError> {
    Ok(Json(runtime.health_report()?))
}
