use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::response::sse::Event;
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::GatewayConfig;

/// Initialize dotenv and structured tracing based on RUST_LOG.
///
/// Env file lookup order:
/// - explicit paths in ENV_FILE, ENVFILE or DOTENV_PATH
/// - `.env` in the working directory
/// - `.env` in the executable's directory or any parent of it
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    for key in ["ENV_FILE", "ENVFILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }

    if env_source == "none" && dotenvy::dotenv().is_ok() {
        env_source = ".env".into();
    }

    if env_source == "none" {
        if let Ok(exe) = std::env::current_exe() {
            let mut dir_opt = exe.parent();
            while let Some(dir) = dir_opt {
                let candidate = dir.join(".env");
                if candidate.is_file() && dotenvy::from_filename(&candidate).is_ok() {
                    env_source = candidate.display().to_string();
                    break;
                }
                dir_opt = dir.parent();
            }
        }
    }

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("Environment loaded from: {}", env_source);
}

/// Build the HTTP client used to reach the backend bridge.
///
/// Only the connect phase is bounded by default; a whole-request timeout is
/// applied when `backend_timeout_secs` is set. Standard HTTP(S)_PROXY
/// variables are honored by reqwest itself.
pub fn build_http_client(config: &GatewayConfig) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .user_agent(format!("openai2daisi/{}", env!("CARGO_PKG_VERSION")));
    if let Some(secs) = config.backend_timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    builder.build().unwrap_or_else(|e| {
        tracing::warn!("falling back to default HTTP client: {e}");
        reqwest::Client::new()
    })
}

/// Fresh call id: `prefix` followed by 32 hex characters.
pub fn new_request_id(prefix: &str) -> String {
    format!("{prefix}{}", uuid::Uuid::new_v4().simple())
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One SSE event carrying `value` as JSON (`data: {...}\n\n` on the wire).
pub fn sse_event<T: Serialize>(value: &T) -> Result<Event, serde_json::Error> {
    Ok(Event::default().data(serde_json::to_string(value)?))
}

/// The `data: [DONE]` terminator.
pub fn sse_done() -> Event {
    Event::default().data("[DONE]")
}

/// Build a CORS layer from environment variables.
///
/// Environment variables:
/// - CORS_ALLOWED_ORIGINS: "*" or comma-separated origins (e.g., "https://a.com, https://b.com")
/// - CORS_ALLOWED_METHODS: "*" or comma-separated methods (e.g., "GET,POST,OPTIONS")
/// - CORS_ALLOWED_HEADERS: "*" or comma-separated request header names
/// - CORS_ALLOW_CREDENTIALS: enable with 1,true,yes,on
/// - CORS_MAX_AGE: max age in seconds (u64)
///
/// Anything unset is permissive (Any).
pub fn cors_layer_from_env() -> tower_http::cors::CorsLayer {
    cors_layer_with(|key| std::env::var(key).ok())
}

/// [`cors_layer_from_env`] with an explicit variable lookup.
///
/// Credentials cannot be combined with a wildcard origin, method or header
/// list; in that case the flag is ignored with a warning.
pub fn cors_layer_with<F>(lookup: F) -> tower_http::cors::CorsLayer
where
    F: Fn(&str) -> Option<String>,
{
    use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};

    let mut layer = CorsLayer::new();
    let mut wildcard = false;

    let origins: Vec<http::HeaderValue> = list_var(&lookup, "CORS_ALLOWED_ORIGINS")
        .unwrap_or_default()
        .iter()
        .filter_map(|p| http::HeaderValue::from_str(p).ok())
        .collect();
    layer = if origins.is_empty() {
        wildcard = true;
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    };

    let methods: Vec<http::Method> = list_var(&lookup, "CORS_ALLOWED_METHODS")
        .unwrap_or_default()
        .iter()
        .filter_map(|p| http::Method::from_bytes(p.to_ascii_uppercase().as_bytes()).ok())
        .collect();
    layer = if methods.is_empty() {
        wildcard = true;
        layer.allow_methods(Any)
    } else {
        layer.allow_methods(AllowMethods::list(methods))
    };

    let headers: Vec<http::HeaderName> = list_var(&lookup, "CORS_ALLOWED_HEADERS")
        .unwrap_or_default()
        .iter()
        .filter_map(|p| http::HeaderName::try_from(p.as_str()).ok())
        .collect();
    layer = if headers.is_empty() {
        wildcard = true;
        layer.allow_headers(Any)
    } else {
        layer.allow_headers(AllowHeaders::list(headers))
    };

    if let Some(val) = lookup("CORS_ALLOW_CREDENTIALS") {
        let v = val.trim().to_ascii_lowercase();
        if v == "1" || v == "true" || v == "yes" || v == "on" {
            if wildcard {
                tracing::warn!(
                    "CORS_ALLOW_CREDENTIALS ignored: origins, methods and headers must all be explicit lists"
                );
            } else {
                layer = layer.allow_credentials(true);
            }
        }
    }

    if let Some(secs) = lookup("CORS_MAX_AGE") {
        if let Ok(n) = secs.trim().parse::<u64>() {
            layer = layer.max_age(Duration::from_secs(n));
        }
    }

    layer
}

/// Comma-separated env list; `None` when unset or `*`.
fn list_var<F>(lookup: &F, key: &str) -> Option<Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    let s = raw.trim();
    if s == "*" {
        return None;
    }
    Some(
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
    )
}
