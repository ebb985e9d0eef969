#![deny(unsafe_code)]

pub mod callables;
pub mod cors;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use chrono::Duration;
use confreg_adapters::{
    InMemoryIdentityProvider, LoggingNotificationSender, SignatureGateway, SignatureGatewayConfig,
    WidgetGateway, WidgetGatewayConfig,
};
use confreg_core::{
    bootstrap_store, Clock, CredentialVerifier, DocumentStore, GatewayRegistry, Identity,
    IdentityBridge, IdentityProvider, NotificationSender, OriginAllowList, PaymentReconciler,
    PhoneVerifier, RegistrationError, StoreConfig, SystemClock,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub store: StoreConfig,
    pub signature: SignatureGatewayConfig,
    pub widget: WidgetGatewayConfig,
    /// Origins allowed in addition to the society domains held in the store.
    pub static_origins: Vec<String>,
    pub origin_cache_ttl_secs: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::Memory,
            signature: SignatureGatewayConfig::default(),
            widget: WidgetGatewayConfig::default(),
            static_origins: Vec::new(),
            origin_cache_ttl_secs: OriginAllowList::DEFAULT_TTL_SECS,
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub store: Arc<dyn DocumentStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub bridge: Arc<IdentityBridge>,
    pub verifier: Arc<CredentialVerifier>,
    pub reconciler: Arc<PaymentReconciler>,
    pub gateways: Arc<GatewayRegistry>,
    pub signature: Arc<SignatureGateway>,
    pub phone: Arc<PhoneVerifier>,
    pub origins: Arc<OriginAllowList>,
    pub clock: Arc<dyn Clock>,
}

impl ServiceState {
    /// Bootstrap with the configured store and the in-process identity provider.
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let store = bootstrap_store(config.store.clone()).await?;
        Self::assemble(
            config,
            store,
            Arc::new(InMemoryIdentityProvider::new()),
            Arc::new(LoggingNotificationSender),
            Arc::new(SystemClock),
        )
    }

    pub fn assemble(
        config: ServiceConfig,
        store: Arc<dyn DocumentStore>,
        identity: Arc<dyn IdentityProvider>,
        notifications: Arc<dyn NotificationSender>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ServiceError> {
        let ServiceConfig {
            store: _,
            signature,
            widget,
            static_origins,
            origin_cache_ttl_secs,
        } = config;

        let signature = Arc::new(SignatureGateway::new(signature, clock.clone())?);
        let mut gateways = GatewayRegistry::new();
        gateways.register(signature.clone());
        gateways.register(Arc::new(WidgetGateway::new(widget)));
        let gateways = Arc::new(gateways);

        let verifier = Arc::new(CredentialVerifier::new(store.clone(), clock.clone()));
        let bridge = Arc::new(IdentityBridge::new(
            identity.clone(),
            store.clone(),
            clock.clone(),
        ));
        let reconciler = Arc::new(PaymentReconciler::new(
            store.clone(),
            gateways.clone(),
            verifier.clone(),
            clock.clone(),
        ));
        let phone = Arc::new(PhoneVerifier::new(
            store.clone(),
            notifications,
            clock.clone(),
        ));
        let origins = Arc::new(
            OriginAllowList::new(
                store.clone(),
                clock.clone(),
                Duration::seconds(origin_cache_ttl_secs),
            )
            .with_static_origins(static_origins),
        );

        Ok(Self {
            store,
            identity,
            bridge,
            verifier,
            reconciler,
            gateways,
            signature,
            phone,
            origins,
            clock,
        })
    }

    /// Resolve the bearer token, if one was presented.
    pub async fn caller(&self, headers: &HeaderMap) -> Result<Option<Identity>, ApiError> {
        let Some(value) = headers.get(axum::http::header::AUTHORIZATION) else {
            return Ok(None);
        };
        let token = value
            .to_str()
            .ok()
            .and_then(|raw| raw.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ApiError::unauthenticated("malformed authorization header"))?;

        let identity = self
            .identity
            .resolve_token(token)
            .await
            .map_err(RegistrationError::from)?
            .ok_or_else(|| ApiError::unauthenticated("invalid or expired token"))?;
        Ok(Some(identity))
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/callable/:name", post(callable))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            cors::origin_guard,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core error: {0}")]
    Core(#[from] RegistrationError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Callable {
        status: StatusCode,
        code: &'static str,
        message: String,
    },
    #[error(transparent)]
    Core(#[from] RegistrationError),
}

impl ApiError {
    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::Callable {
            status: StatusCode::NOT_FOUND,
            code: "not-found",
            message: message.into(),
        }
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::Callable {
            status: StatusCode::BAD_REQUEST,
            code: "invalid-argument",
            message: message.into(),
        }
    }

    pub(crate) fn unauthenticated(message: impl Into<String>) -> Self {
        Self::Callable {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthenticated",
            message: message.into(),
        }
    }

    pub(crate) fn forbidden(message: impl Into<String>) -> Self {
        Self::Callable {
            status: StatusCode::FORBIDDEN,
            code: "permission-denied",
            message: message.into(),
        }
    }
}

fn status_for(code: &str) -> StatusCode {
    match code {
        "invalid-argument" | "failed-precondition" => StatusCode::BAD_REQUEST,
        "unauthenticated" => StatusCode::UNAUTHORIZED,
        "not-found" => StatusCode::NOT_FOUND,
        "already-exists" => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(status: StatusCode, code: &str, message: String) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": { "status": code, "message": message } })),
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Callable {
                status,
                code,
                message,
            } => error_body(status, code, message),
            ApiError::Core(err) => {
                let code = err.code();
                if err.is_validation() {
                    debug!(code = code, error = %err, "callable rejected request");
                    error_body(status_for(code), code, err.to_string())
                } else {
                    error!(code = code, error = %err, "callable failed");
                    error_body(status_for(code), code, "internal error".to_string())
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
    gateways: Vec<String>,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "confreg-service",
        storage_backend: state.store.backend_label(),
        gateways: state.gateways.providers(),
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CallableEnvelope {
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, Serialize)]
struct CallableResult {
    result: Value,
}

async fn callable(
    Path(name): Path<String>,
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(envelope): Json<CallableEnvelope>,
) -> Result<Json<CallableResult>, ApiError> {
    let caller = state.caller(&headers).await?;
    let result = callables::dispatch(&state, &name, caller.as_ref(), envelope.data).await?;
    Ok(Json(CallableResult { result }))
}
