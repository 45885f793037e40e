//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

/// Token cache TTL - cache Supabase verification results for 60 seconds
/// This keeps parallel dashboard requests from hitting Supabase rate limits
const TOKEN_CACHE_TTL: Duration = Duration::from_secs(60);

/// Maximum cache entries; the oldest entry is evicted beyond this
const MAX_CACHE_ENTRIES: usize = 10_000;

/// In-flight verification result shared with coalesced waiters
#[derive(Clone, Debug)]
pub(crate) struct InFlightVerificationResult {
    pub user_id: String,
    pub email: Option<String>,
}

type InFlightResult = Result<InFlightVerificationResult, ()>;

/// Token verification requests currently waiting on Supabase
pub(crate) type InFlightRequests = Arc<Mutex<HashMap<String, broadcast::Sender<InFlightResult>>>>;

/// Cached authentication result from Supabase
#[derive(Clone, Debug)]
pub(crate) struct CachedSupabaseAuth {
    user: SupabaseUserResponse,
    cached_at: Instant,
}

/// Thread-safe token cache type (crate-internal, not part of public API)
pub(crate) type TokenCache = Arc<RwLock<HashMap<String, CachedSupabaseAuth>>>;

/// Authenticated caller, inserted into request extensions by [`require_auth`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
}

/// Response from Supabase /auth/v1/user endpoint
#[derive(Debug, Clone, Deserialize)]
struct SupabaseUserResponse {
    id: String,
    email: Option<String>,
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub supabase_url: String,
    pub supabase_service_role_key: String,
    pub http_client: Client,
    /// Cache for Supabase token verification results to prevent rate limiting
    pub(crate) token_cache: TokenCache,
    /// Track in-flight Supabase verification requests for request coalescing
    pub(crate) in_flight_requests: InFlightRequests,
}

impl AuthState {
    pub fn new(supabase_url: &str, supabase_service_role_key: &str, http_client: Client) -> Self {
        Self {
            supabase_url: supabase_url.trim_end_matches('/').to_string(),
            supabase_service_role_key: supabase_service_role_key.to_string(),
            http_client,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
            in_flight_requests: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Extract bearer token from the Authorization header
fn extract_bearer_token(request: &Request) -> Result<Option<String>, AuthError> {
    let Some(header) = request.headers().get(AUTHORIZATION) else {
        return Ok(None);
    };
    let header = header.to_str().map_err(|_| AuthError::InvalidAuthFormat)?;
    match header.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => Ok(Some(token.trim().to_string())),
        _ => Err(AuthError::InvalidAuthFormat),
    }
}

/// Middleware that requires a valid Supabase session token
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = match extract_bearer_token(&request) {
        Ok(Some(token)) => authenticate_bearer(&auth_state, &token).await,
        Ok(None) => Err(AuthError::MissingAuth),
        Err(e) => Err(e),
    };

    match auth_result {
        Ok(auth_user) => {
            tracing::debug!(path = %path, user_id = %auth_user.user_id, "require_auth: authentication successful");
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

/// Resolve a bearer token to the user it belongs to
pub async fn authenticate_bearer(auth_state: &AuthState, token: &str) -> Result<AuthUser, AuthError> {
    let user = verify_supabase_token_via_api(auth_state, token).await?;
    let user_id = Uuid::parse_str(&user.id).map_err(|_| {
        tracing::warn!(user_id = %user.id, "Supabase returned a non-UUID user id");
        AuthError::InvalidToken
    })?;

    Ok(AuthUser {
        user_id,
        email: user.email,
    })
}

/// Verify a Supabase token by calling the Supabase Auth API
/// Uses caching and request coalescing so parallel requests with the same
/// token cost one upstream call
async fn verify_supabase_token_via_api(
    auth_state: &AuthState,
    token: &str,
) -> Result<SupabaseUserResponse, AuthError> {
    if auth_state.supabase_service_role_key.is_empty() {
        tracing::warn!("Supabase service role key not configured, cannot verify token via API");
        return Err(AuthError::InvalidToken);
    }

    {
        let cache = auth_state.token_cache.read().await;
        if let Some(cached) = cache.get(token) {
            if cached.cached_at.elapsed() < TOKEN_CACHE_TTL {
                tracing::debug!("Using cached Supabase auth for user {}", cached.user.id);
                return Ok(cached.user.clone());
            }
        }
    }

    let token_key = token.to_string();
    let mut rx_opt = None;

    {
        let mut in_flight = auth_state.in_flight_requests.lock().await;
        if let Some(tx) = in_flight.get(&token_key) {
            rx_opt = Some(tx.subscribe());
            tracing::debug!("Joining in-flight Supabase verification request");
        } else {
            let (tx, _) = broadcast::channel(1);
            in_flight.insert(token_key.clone(), tx);
        }
    }

    if let Some(mut rx) = rx_opt {
        return match rx.recv().await {
            Ok(Ok(result)) => Ok(SupabaseUserResponse {
                id: result.user_id,
                email: result.email,
            }),
            Ok(Err(())) | Err(_) => Err(AuthError::InvalidToken),
        };
    }

    let mut leader = InFlightGuard {
        in_flight: auth_state.in_flight_requests.clone(),
        token_key: Some(token_key),
    };

    let result = verify_supabase_token_api_call(auth_state, token).await;

    {
        let token_key = leader.token_key.take().unwrap_or_default();
        let mut in_flight = auth_state.in_flight_requests.lock().await;
        if let Some(tx) = in_flight.remove(&token_key) {
            let broadcast_result = match &result {
                Ok(user) => Ok(InFlightVerificationResult {
                    user_id: user.id.clone(),
                    email: user.email.clone(),
                }),
                Err(_) => Err(()),
            };
            // Receivers may have been dropped
            let _ = tx.send(broadcast_result);
        }
    }

    if let Ok(ref user) = result {
        let mut cache = auth_state.token_cache.write().await;

        if cache.len() >= MAX_CACHE_ENTRIES {
            if let Some(oldest_key) = cache
                .iter()
                .min_by_key(|(_, v)| v.cached_at)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest_key);
                tracing::debug!("Evicted oldest cache entry to stay under limit");
            }
        }

        cache.insert(
            token.to_string(),
            CachedSupabaseAuth {
                user: user.clone(),
                cached_at: Instant::now(),
            },
        );
    }

    result
}

/// Owns the in-flight entry of the leading verification
///
/// If the leader is dropped before it broadcasts, the entry is removed so the
/// sender closes and coalesced waiters fail instead of hanging.
struct InFlightGuard {
    in_flight: InFlightRequests,
    token_key: Option<String>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let Some(token_key) = self.token_key.take() else {
            return;
        };

        if let Ok(mut in_flight) = self.in_flight.try_lock() {
            in_flight.remove(&token_key);
            return;
        }

        let in_flight = self.in_flight.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    in_flight.lock().await.remove(&token_key);
                });
            }
            Err(_) => tracing::warn!("Dropped in-flight verification outside a runtime"),
        }
    }
}

/// Actually make the API call to Supabase to verify a token
async fn verify_supabase_token_api_call(
    auth_state: &AuthState,
    token: &str,
) -> Result<SupabaseUserResponse, AuthError> {
    let url = format!("{}/auth/v1/user", auth_state.supabase_url);

    let response = auth_state
        .http_client
        .get(&url)
        .header("apikey", &auth_state.supabase_service_role_key)
        .header("Authorization", format!("Bearer {}", token))
        .send()
        .await
        .map_err(|e| {
            tracing::error!("Failed to verify Supabase token: {}", e);
            AuthError::InvalidToken
        })?;

    if !response.status().is_success() {
        tracing::warn!(
            "Supabase token verification failed with status: {}",
            response.status()
        );
        return Err(AuthError::InvalidToken);
    }

    response
        .json::<SupabaseUserResponse>()
        .await
        .map_err(|_| AuthError::InvalidToken)
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid authentication format")]
    InvalidAuthFormat,
    #[error("Invalid or expired token")]
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = StatusCode::UNAUTHORIZED;
        let message = match self {
            AuthError::MissingAuth => "Authentication required",
            AuthError::InvalidAuthFormat => "Invalid authentication format",
            AuthError::InvalidToken => "Invalid or expired token",
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
