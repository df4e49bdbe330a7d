use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use directories::ProjectDirs;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::require_admin_token,
    handlers::{create_secret, health, prune_secrets, redeem_secret},
    lookup::ServerSecret,
    reaper::{ExpiryReaper, DEFAULT_SWEEP_INTERVAL},
    service::{SecretService, ServiceConfig},
    store::{crypto, Store},
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// Keys lookup-key derivation. Required to run.
    pub server_secret: Option<ServerSecret>,
    /// Enables `POST /prune` when set.
    pub admin_token: Option<String>,
    pub sweep_interval: Duration,
    pub cors_origins: Option<String>,
    pub service: ServiceConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            data_dir: None,
            server_secret: None,
            admin_token: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            cors_origins: None,
            service: ServiceConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read `BURNBOX_*` variables over the defaults. Malformed values are errors.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let service = ServiceConfig {
            retention: env_duration("BURNBOX_RETENTION")?.unwrap_or(defaults.service.retention),
            code_length: env_parse("BURNBOX_CODE_LENGTH")?
                .unwrap_or(defaults.service.code_length),
            code_alphabet: std::env::var("BURNBOX_CODE_ALPHABET")
                .unwrap_or(defaults.service.code_alphabet),
            max_payload_size: env_parse("BURNBOX_MAX_PAYLOAD")?
                .unwrap_or(defaults.service.max_payload_size),
            max_create_attempts: defaults.service.max_create_attempts,
        };

        Ok(Self {
            host: std::env::var("BURNBOX_HOST").unwrap_or(defaults.host),
            port: env_parse("BURNBOX_PORT")?.unwrap_or(defaults.port),
            data_dir: std::env::var("BURNBOX_DATA_DIR").ok().map(PathBuf::from),
            server_secret: resolve_server_secret()?,
            admin_token: std::env::var("BURNBOX_ADMIN_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            sweep_interval: env_duration("BURNBOX_SWEEP_INTERVAL")?
                .unwrap_or(defaults.sweep_interval),
            cors_origins: std::env::var("BURNBOX_CORS_ORIGINS").ok(),
            service,
        })
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {name}={raw:?}: {e}")),
        Err(_) => Ok(None),
    }
}

fn env_duration(name: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<humantime::Duration>(name)?.map(Into::into))
}

/// Read a secret from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_secret_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read secret file: {}", path.display()))?;
    let secret = content.trim().to_string();
    if secret.is_empty() {
        anyhow::bail!("secret file is empty: {}", path.display());
    }
    Ok(secret)
}

/// Resolve the server secret from `BURNBOX_SERVER_SECRET_FILE` (preferred) or
/// `BURNBOX_SERVER_SECRET`. File-based delivery keeps the value out of
/// `docker inspect` and `/proc`.
fn resolve_server_secret() -> Result<Option<ServerSecret>> {
    let raw = if let Ok(path) = std::env::var("BURNBOX_SERVER_SECRET_FILE") {
        let secret = read_secret_file(Path::new(&path))?;
        if std::env::var("BURNBOX_SERVER_SECRET").is_ok() {
            warn!("both BURNBOX_SERVER_SECRET and BURNBOX_SERVER_SECRET_FILE are set; using file");
        }
        secret
    } else {
        match std::env::var("BURNBOX_SERVER_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => return Ok(None),
        }
    };
    Ok(Some(ServerSecret::new(raw.into_bytes())?))
}

/// Directory holding `burnbox.db` and `burnbox.key`, created if missing.
///
/// An explicit `data_dir` wins, then `BURNBOX_DATA_DIR`, then the platform
/// data dir (`~/.local/share/burnbox/` on Linux).
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    let path = match data_dir {
        Some(d) => d.clone(),
        None => match std::env::var_os("BURNBOX_DATA_DIR") {
            Some(d) => PathBuf::from(d),
            None => ProjectDirs::from("", "", "burnbox")
                .context("could not determine platform data directory")?
                .data_dir()
                .to_owned(),
        },
    };
    std::fs::create_dir_all(&path)
        .with_context(|| format!("create data dir: {}", path.display()))?;
    Ok(path)
}

/// Public and admin routes over `state`.
pub fn build_router(state: AppState, cors_origins: Option<&str>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/secrets", post(create_secret))
        .route("/secrets/redeem", post(redeem_secret));

    if state.admin_token.is_some() {
        let admin = Router::new()
            .route("/prune", post(prune_secrets))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                require_admin_token,
            ));
        app = app.merge(admin);
    }

    app.with_state(state)
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let server_secret = cfg.server_secret.context(
        "BURNBOX_SERVER_SECRET or BURNBOX_SERVER_SECRET_FILE environment variable is required",
    )?;

    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let enc_key = load_or_create_key(&data_dir)?;
    let store = Store::open(&data_dir.join("burnbox.db"), enc_key).context("open store")?;

    let service = SecretService::new(store.clone(), server_secret, cfg.service)?;

    // Sweep once at startup so a long outage does not leave a backlog.
    let reaper = ExpiryReaper::new(store, cfg.sweep_interval);
    if let Err(e) = reaper.sweep_once() {
        warn!(error = %e, "startup sweep error");
    }
    reaper.spawn();

    if cfg.admin_token.is_none() {
        info!("BURNBOX_ADMIN_TOKEN not set; admin prune route disabled");
    }

    let state = AppState {
        service,
        admin_token: cfg.admin_token,
    };
    let app = build_router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "burnbox server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}

fn load_or_create_key(data_dir: &Path) -> Result<crypto::EncryptionKey> {
    let key_path = data_dir.join("burnbox.key");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("read burnbox.key")?;
        crypto::load_key(&bytes).ok_or_else(|| {
            anyhow::anyhow!(
                "burnbox.key is corrupt (expected {} bytes, got {})",
                crypto::KEY_SIZE,
                bytes.len()
            )
        })
    } else {
        let key = crypto::generate_key();
        write_key_file(&key_path, key.as_bytes()).context("write burnbox.key")?;
        info!("generated new encryption key");
        Ok(key)
    }
}

/// Create `path` readable by the owner only. Never replaces an existing file.
fn write_key_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tempfile::tempdir;
    use tower::ServiceExt;

    use super::*;

    fn test_app(admin_token: Option<&str>) -> (Router, SecretService, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db"), crypto::generate_key()).unwrap();
        let secret = ServerSecret::new(b"router-test-server-secret".to_vec()).unwrap();
        let service = SecretService::new(store, secret, ServiceConfig::default()).unwrap();
        let state = AppState {
            service: service.clone(),
            admin_token: admin_token.map(str::to_owned),
        };
        (build_router(state, None), service, dir)
    }

    async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_ok() {
        let (app, _svc, _dir) = test_app(None);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_and_redeem_over_http() {
        let (app, _svc, _dir) = test_app(None);

        let (status, created) = post_json(&app, "/secrets", json!({"content": "Secret"})).await;
        assert_eq!(status, StatusCode::CREATED);
        let code = created["code"].as_str().unwrap().to_owned();
        assert_eq!(code.len(), 8);
        assert!(created["expires_at"].as_i64().is_some());

        let (status, body) =
            post_json(&app, "/secrets/redeem", json!({"code": code.to_lowercase()})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["content"], "Secret");

        let (status, body) = post_json(&app, "/secrets/redeem", json!({"code": code})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "That message key is no longer valid.");
        assert!(body.get("content").is_none());
    }

    #[tokio::test]
    async fn validation_errors_name_the_field() {
        let (app, svc, _dir) = test_app(None);

        let (status, body) = post_json(&app, "/secrets", json!({"content": ""})).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["field"], "content");

        let too_long = "a".repeat(10_001);
        let (status, _) = post_json(&app, "/secrets", json!({"content": too_long})).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = post_json(&app, "/secrets/redeem", json!({"code": ""})).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["field"], "code");

        assert_eq!(svc.store().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn wrong_and_expired_codes_look_identical() {
        let (app, svc, _dir) = test_app(None);
        let key = svc.hasher().hash("EXPRD234");
        svc.store().insert(&key, b"Expired", Store::now() - 1).unwrap();

        let expired = post_json(&app, "/secrets/redeem", json!({"code": "EXPRD234"})).await;
        let wrong = post_json(&app, "/secrets/redeem", json!({"code": "WRONGCOD"})).await;
        assert_eq!(expired, wrong);
        assert_eq!(svc.store().count().unwrap(), 1);
    }

    #[tokio::test]
    async fn prune_requires_admin_token() {
        let (app, svc, _dir) = test_app(Some("admin-token"));
        svc.store()
            .insert(&svc.hasher().hash("OLDCODE2"), b"old", Store::now() - 1)
            .unwrap();

        let (status, _) = post_json(&app, "/prune", json!({})).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/prune")
                    .header("Authorization", "Bearer admin-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["pruned"], 1);
    }

    #[tokio::test]
    async fn prune_unmounted_without_admin_token() {
        let (app, _svc, _dir) = test_app(None);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/prune")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn key_file_is_created_then_reused() {
        let dir = tempdir().unwrap();
        let first = *load_or_create_key(dir.path()).unwrap().as_bytes();
        let second = *load_or_create_key(dir.path()).unwrap().as_bytes();
        assert_eq!(first, second);

        std::fs::write(dir.path().join("burnbox.key"), b"short").unwrap();
        assert!(load_or_create_key(dir.path()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        load_or_create_key(dir.path()).unwrap();
        let mode = std::fs::metadata(dir.path().join("burnbox.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn explicit_data_dir_is_created() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let resolved = resolve_data_dir(Some(&nested)).unwrap();
        assert_eq!(resolved, nested);
        assert!(nested.is_dir());
    }

    #[test]
    fn secret_file_is_trimmed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secret");
        std::fs::write(&path, "  from-a-file-value \n").unwrap();
        assert_eq!(read_secret_file(&path).unwrap(), "from-a-file-value");

        std::fs::write(&path, "   \n").unwrap();
        assert!(read_secret_file(&path).is_err());
    }
}
