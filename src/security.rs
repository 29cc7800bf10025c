use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{
        self, Request, StatusCode,
        header::{HeaderValue, IntoHeaderName},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

const KEY_HEADER: &str = "X-Sync-Key";

#[derive(Clone)]
pub struct AuthState {
    keys: Arc<HashMap<String, AuthContext>>,
    limiter: Arc<TokenBuckets>,
}

/// Caller identity attached to every authenticated request. All catalog and
/// sync data is scoped by `company_id`.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub company_id: String,
    pub api_key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let keys = parse_keys(lookup("SYNC_API_KEYS").as_deref().unwrap_or(""));
        let rate_per_sec = lookup("RATE_LIMIT_PER_SEC")
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = lookup("RATE_LIMIT_CAPACITY")
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|value| *value >= 1.0)
            .unwrap_or(10.0);
        Self {
            keys: Arc::new(keys),
            limiter: Arc::new(TokenBuckets::new(rate_per_sec, capacity)),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.keys.get(presented).cloned()
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(reject(
            StatusCode::UNAUTHORIZED,
            "missing_api_key",
            "Provide X-Sync-Key or a Bearer token",
        ));
    };

    let Some(context) = state.authenticate(&presented) else {
        return Ok(reject(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key",
            "Key not recognized",
        ));
    };

    match state.limiter.consume(&context.company_id).await {
        Ok(permit) => {
            request.extensions_mut().insert(context);
            let mut response = next.run(request).await;
            permit.apply_headers(response.headers_mut(), false);
            Ok(response)
        }
        Err(exceeded) => {
            warn!(
                target = "pim_sync.api",
                company_id = %context.company_id,
                "rate_limited"
            );
            let mut response = reject(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Too many requests",
            );
            exceeded.apply_headers(response.headers_mut(), true);
            Ok(response)
        }
    }
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string()).filter(|value| !value.is_empty());
    }
    headers
        .get(KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn reject(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(ApiError::new(code, message))).into_response()
}

/// Parses `company:key` pairs separated by commas. Without any usable entry
/// a single local development key is installed.
fn parse_keys(raw: &str) -> HashMap<String, AuthContext> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let company = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (company, key) {
            (Some(company), Some(secret)) => {
                entries.insert(
                    secret.to_string(),
                    AuthContext {
                        company_id: company.to_string(),
                        api_key_id: format!("key-{:02}", idx + 1),
                    },
                );
            }
            _ => warn!(
                target = "pim_sync.api",
                "ignored malformed SYNC_API_KEYS entry at position {}",
                idx + 1
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "pim_sync.api",
            "SYNC_API_KEYS produced no keys; accepting local-dev-key for company local"
        );
        entries.insert(
            "local-dev-key".to_string(),
            AuthContext {
                company_id: "local".to_string(),
                api_key_id: "key-01".to_string(),
            },
        );
    } else {
        info!(
            target = "pim_sync.api",
            key_count = entries.len(),
            "loaded API keys"
        );
    }
    entries
}

struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<String, BucketState>>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBuckets {
    fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn consume(&self, company_id: &str) -> Result<RateWindow, RateWindow> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let state = guard
            .entry(company_id.to_string())
            .or_insert_with(|| BucketState {
                tokens: self.capacity,
                last_refill: now,
            });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        let allowed = state.tokens >= 1.0;
        if allowed {
            state.tokens -= 1.0;
        }
        let window = RateWindow {
            capacity: self.capacity,
            tokens: state.tokens,
            rate: self.rate_per_sec,
        };
        if allowed { Ok(window) } else { Err(window) }
    }
}

/// Bucket state reported back to the caller, whether or not the request
/// was admitted.
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RateWindow {
    fn reset_secs(&self) -> u64 {
        ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64
    }

    fn apply_headers(&self, headers: &mut http::HeaderMap, denied: bool) {
        let remaining = self.tokens.max(0.0).floor() as u64;
        put_number(headers, "X-RateLimit-Limit", self.capacity as u64);
        put_number(headers, "X-RateLimit-Remaining", remaining);
        put_number(headers, "X-RateLimit-Reset", self.reset_secs());
        if denied {
            let retry_after = ((1.0 - self.tokens) / self.rate).ceil().max(1.0) as u64;
            put_number(headers, http::header::RETRY_AFTER, retry_after);
        }
    }
}

fn put_number<K: IntoHeaderName>(headers: &mut http::HeaderMap, name: K, value: u64) {
    headers.insert(
        name,
        HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
}
