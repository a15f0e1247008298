//! Axum integration
//!
//! The gate runs as a middleware in front of protected routes. Routes
//! attach their policy with a [`GateRoute`] extension; handlers receive
//! the resolved [`GateContext`] as an extractor.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::auth::{RateClass, RateQuota};
use crate::error::AppError;
use crate::pipeline::{EndpointConfig, Gate, GateContext, GateRequest};

/// Per-route gate policy, attached as a layer
///
/// ```ignore
/// Router::new()
///     .route("/stream", post(start_stream))
///     .layer(Extension(GateRoute::new(EndpointConfig::stream_start())))
///     .layer(middleware::from_fn_with_state(gate, gate_middleware))
/// ```
#[derive(Clone)]
pub struct GateRoute(Arc<EndpointConfig>);

impl GateRoute {
    pub fn new(endpoint: EndpointConfig) -> Self {
        Self(Arc::new(endpoint))
    }
}

/// Run the gate pipeline for one request
///
/// The pipeline runs on its own task so that its store writes (device
/// last-seen, corrective blocks) complete even when the client
/// disconnects mid-request.
pub async fn gate_middleware(
    State(gate): State<Arc<Gate>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let endpoint = request
        .extensions()
        .get::<GateRoute>()
        .map(|r| r.0.clone())
        .unwrap_or_else(|| Arc::new(EndpointConfig::api()));
    let gate_request = extract_gate_request(&request);

    let run_gate = gate.clone();
    let run_endpoint = endpoint.clone();
    let run_request = gate_request.clone();
    let context = tokio::spawn(async move { run_gate.run(&run_endpoint, &run_request).await })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "gate task panicked");
            AppError::internal("gate task failed")
        })??;

    let identity_id = context.identity.id.clone();
    request.extensions_mut().insert(context);
    let response = next.run(request).await;
    if response.status().is_success() {
        gate.forgive_success(&endpoint, &gate_request, &identity_id);
    }
    Ok(response)
}

/// Address-keyed limiter for login and token-issuance routes
///
/// These routes run before any credential exists, so they sit outside
/// the gate pipeline. When the class quota is configured to forgive
/// success, only failed attempts consume the window.
pub async fn auth_rate_limit(
    State(gate): State<Arc<Gate>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let addr = client_addr(&request).unwrap_or_else(|| "unknown".to_owned());
    let quota = RateQuota::for_class(RateClass::Auth);

    let decision = gate.limiter().check_with_quota(RateClass::Auth, &addr, quota);
    if !decision.allowed {
        return Err(AppError::rate_limited(decision.retry_after_seconds));
    }

    let response = next.run(request).await;
    if quota.forgive_success && response.status().is_success() {
        gate.forgive(RateClass::Auth, &addr);
    }
    Ok(response)
}

/// Pull the gate inputs out of a request
///
/// Token precedence: `Authorization: Bearer` first, then the
/// `access_token` cookie. Device id comes from `X-Device-Id`. Client
/// address prefers `X-Forwarded-For` (first entry) over the peer
/// address.
pub fn extract_gate_request(request: &Request) -> GateRequest {
    let token = bearer_token(request).or_else(|| cookie_token(request, "access_token"));
    let device_id = request
        .headers()
        .get("x-device-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    GateRequest {
        token,
        device_id,
        addr: client_addr(request),
    }
}

fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

fn cookie_token(request: &Request, name: &str) -> Option<String> {
    let cookies = request
        .headers()
        .get(http::header::COOKIE)
        .and_then(|v| v.to_str().ok())?;
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_owned())
    })
}

/// Client address: X-Forwarded-For first (load balancer), then peer
fn client_addr(request: &Request) -> Option<String> {
    if let Some(forwarded) = request.headers().get("x-forwarded-for")
        && let Ok(val) = forwarded.to_str()
        && let Some(first) = val.split(',').next()
    {
        let ip = first.trim();
        if !ip.is_empty() {
            return Some(ip.to_owned());
        }
    }

    request
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
}

impl<S> FromRequestParts<S> for GateContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<GateContext>().cloned().ok_or_else(|| {
            tracing::error!("GateContext extractor used on a route without gate_middleware");
            AppError::internal("gate context missing")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        DeviceInfo, DeviceKind, FeatureGrant, Identity, Plan, Role, Subscription,
        SubscriptionStatus,
    };
    use crate::model::Feature;
    use crate::store::MemoryStore;
    use axum::{middleware, routing::get, Extension, Json, Router};
    use chrono::{Duration, Utc};
    use http::{Request as HttpRequest, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_plan(Plan {
                id: "plan-standard".into(),
                name: "Standard".into(),
                device_limit: 2,
                simultaneous_streams: 2,
                allowed_device_kinds: vec![DeviceKind::Web],
                features: vec![FeatureGrant::new(Feature::Hdr)],
            })
            .await;
        store
            .insert_user(Identity {
                id: "user-1".into(),
                role: Role::Subscriber,
                active: true,
                subscription: Some(Subscription {
                    plan_id: "plan-standard".into(),
                    status: SubscriptionStatus::Active,
                    period_start: Utc::now() - Duration::days(1),
                    period_end: Utc::now() + Duration::days(29),
                    plan_changed_at: None,
                }),
            })
            .await;
        store
    }

    async fn gate() -> Arc<Gate> {
        Arc::new(
            Gate::builder()
                .store(seeded_store().await)
                .build()
                .unwrap(),
        )
    }

    async fn whoami(context: GateContext) -> Json<String> {
        Json(context.identity.id)
    }

    fn app(gate: Arc<Gate>, endpoint: EndpointConfig) -> Router {
        Router::new()
            .route("/whoami", get(whoami))
            .layer(middleware::from_fn_with_state(gate, gate_middleware))
            .layer(Extension(GateRoute::new(endpoint)))
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_missing_token_is_401() {
        let app = app(gate().await, EndpointConfig::api());
        let response = app
            .oneshot(HttpRequest::get("/whoami").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(body_string(response).await.contains("UNAUTHORIZED"));
    }

    #[tokio::test]
    async fn test_bearer_token_accepted() {
        let gate = gate().await;
        let token = gate.tokens().issue_token("user-1").unwrap();
        let app = app(gate, EndpointConfig::api());

        let response = app
            .oneshot(
                HttpRequest::get("/whoami")
                    .header("authorization", format!("Bearer {token}"))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("user-1"));
    }

    #[tokio::test]
    async fn test_cookie_token_accepted() {
        let gate = gate().await;
        let token = gate.tokens().issue_token("user-1").unwrap();
        let app = app(gate, EndpointConfig::api());

        let response = app
            .oneshot(
                HttpRequest::get("/whoami")
                    .header("cookie", format!("theme=dark; access_token={token}"))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unverified_device_is_403() {
        let gate = gate().await;
        let token = gate.tokens().issue_token("user-1").unwrap();
        let user = Identity {
            id: "user-1".into(),
            role: Role::Subscriber,
            active: true,
            subscription: None,
        };
        let out = gate
            .devices()
            .register(
                &user,
                &Plan {
                    id: "plan-standard".into(),
                    name: "Standard".into(),
                    device_limit: 2,
                    simultaneous_streams: 2,
                    allowed_device_kinds: vec![DeviceKind::Web],
                    features: vec![],
                },
                &DeviceInfo {
                    kind: DeviceKind::Web,
                    platform: "Firefox 142".into(),
                    name: "Laptop".into(),
                },
                None,
            )
            .await
            .unwrap();
        let code = out.verification_code.unwrap();
        let app = app(gate.clone(), EndpointConfig::api().require_device());

        let request = |token: &str, device: &str| {
            HttpRequest::get("/whoami")
                .header("authorization", format!("Bearer {token}"))
                .header("x-device-id", device)
                .body(axum::body::Body::empty())
                .unwrap()
        };

        let response = app.clone().oneshot(request(&token, &out.device.id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(body_string(response).await.contains("DEVICE_NOT_VERIFIED"));

        gate.devices().verify(&out.device.id, &code).await.unwrap();
        let response = app.oneshot(request(&token, &out.device.id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_auth_rate_limit_with_retry_after() {
        let gate = gate().await;
        let app = Router::new()
            .route("/login", get(|| async { StatusCode::UNAUTHORIZED }))
            .layer(middleware::from_fn_with_state(gate, auth_rate_limit));

        let request = || {
            HttpRequest::get("/login")
                .header("x-forwarded-for", "203.0.113.7")
                .body(axum::body::Body::empty())
                .unwrap()
        };
        // Failed logins burn the window
        for _ in 0..5 {
            let response = app.clone().oneshot(request()).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get(http::header::RETRY_AFTER).is_some());
    }

    #[tokio::test]
    async fn test_auth_rate_limit_forgives_success() {
        let gate = gate().await;
        let app = Router::new()
            .route("/login", get(|| async { StatusCode::OK }))
            .layer(middleware::from_fn_with_state(gate, auth_rate_limit));

        // Far more successes than the window allows for failures
        for _ in 0..20 {
            let response = app
                .clone()
                .oneshot(
                    HttpRequest::get("/login")
                        .header("x-forwarded-for", "203.0.113.7")
                        .body(axum::body::Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[test]
    fn test_extract_precedence_and_headers() {
        let request = HttpRequest::get("/")
            .header("authorization", "Bearer header-token")
            .header("cookie", "access_token=cookie-token")
            .header("x-device-id", "dev-9")
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(axum::body::Body::empty())
            .unwrap();
        let extracted = extract_gate_request(&request);
        assert_eq!(extracted.token.as_deref(), Some("header-token"));
        assert_eq!(extracted.device_id.as_deref(), Some("dev-9"));
        assert_eq!(extracted.addr.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn test_cookie_fallback() {
        let request = HttpRequest::get("/")
            .header("cookie", "a=1; access_token=cookie-token; b=2")
            .body(axum::body::Body::empty())
            .unwrap();
        let extracted = extract_gate_request(&request);
        assert_eq!(extracted.token.as_deref(), Some("cookie-token"));
    }
}
