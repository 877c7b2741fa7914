#![deny(unsafe_code)]

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use onboard_adapters::{FsBlobStore, HttpIpLookup};
use onboard_core::otp::normalize_phone;
use onboard_core::{
    AccessGate, Admin, AdminReviewConsole, AdminRole, AuthFailure, BlobStorage, DisplayTransform,
    DocumentGenerator, DocumentStore, FillForm, Identity, IdentityProvider,
    IdentitySessionManager, InMemoryBlobStore, InMemoryDocumentStore, InMemoryIdentityProvider,
    Investor, InvestorDetail, InvestorRepository, InvestorStatus, IpLookup, NdaWorkflow,
    OnboardConfig, OnboardError, OtpVerifier, Point, Profile, ReviewOutcome, Route,
    SessionPersistence, StaticIpLookup, StatusFilter, TemplateRegistry, WorkflowServices,
    WorkflowView,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Document store backend.
#[derive(Debug, Clone, Default)]
pub enum StorageConfig {
    #[default]
    Memory,
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// Where signed agreements are written.
#[derive(Debug, Clone, Default)]
pub enum BlobConfig {
    #[default]
    Memory,
    Filesystem { root: PathBuf, base_url: String },
}

#[derive(Debug, Clone)]
pub enum IpLookupConfig {
    /// Record this value when the peer address is unavailable.
    Fixed(String),
    Http { endpoint: String },
}

/// Admin account created at startup when missing.
#[derive(Debug, Clone)]
pub struct AdminBootstrap {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
    pub blobs: BlobConfig,
    pub ip_lookup: IpLookupConfig,
    /// Peers whose `x-forwarded-for` and `x-real-ip` headers are believed.
    pub trusted_proxies: Vec<IpAddr>,
    /// Signing sessions untouched for this long are discarded.
    pub workflow_idle: Duration,
    pub admin: Option<AdminBootstrap>,
    pub onboard: OnboardConfig,
    /// Every OTP is this code instead of a random one. Local development only.
    pub fixed_otp_code: Option<String>,
    /// Log issued OTP codes, since the reference provider sends no SMS.
    pub log_otp_codes: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,
            blobs: BlobConfig::Memory,
            ip_lookup: IpLookupConfig::Fixed(onboard_core::workflow::UNKNOWN_IP.to_string()),
            trusted_proxies: Vec::new(),
            workflow_idle: Duration::from_secs(30 * 60),
            admin: None,
            onboard: OnboardConfig::default(),
            fixed_otp_code: None,
            log_otp_codes: false,
        }
    }
}

/// Open signing session and when a request last used it.
struct WorkflowSlot {
    workflow: Arc<Mutex<NdaWorkflow>>,
    touched: Instant,
}

#[derive(Clone)]
pub struct ServiceState {
    pub sessions: Arc<IdentitySessionManager>,
    pub provider: Arc<InMemoryIdentityProvider>,
    pub investors: InvestorRepository,
    pub services: WorkflowServices,
    pub console: AdminReviewConsole,
    pub gate: AccessGate,
    workflows: Arc<Mutex<HashMap<String, WorkflowSlot>>>,
    workflow_idle: Duration,
    trusted_proxies: Arc<[IpAddr]>,
    storage_backend: &'static str,
    log_otp_codes: bool,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig {
            storage,
            blobs,
            ip_lookup,
            trusted_proxies,
            workflow_idle,
            admin,
            onboard,
            fixed_otp_code,
            log_otp_codes,
        } = config;

        let storage_backend = storage.label();
        let store = connect_store(storage).await?;
        let investors = InvestorRepository::new(store.clone());

        let provider = InMemoryIdentityProvider::new().with_account_store(store);
        let provider = Arc::new(match fixed_otp_code {
            Some(code) => provider.with_fixed_code(code),
            None => provider,
        });
        let sessions = Arc::new(IdentitySessionManager::new(
            provider.clone(),
            investors.clone(),
        ));

        let blobs: Arc<dyn BlobStorage> = match blobs {
            BlobConfig::Memory => Arc::new(InMemoryBlobStore::new()),
            BlobConfig::Filesystem { root, base_url } => Arc::new(FsBlobStore::new(root, base_url)),
        };
        let ip_lookup: Arc<dyn IpLookup> = match ip_lookup {
            IpLookupConfig::Fixed(ip) => Arc::new(StaticIpLookup::new(ip)),
            IpLookupConfig::Http { endpoint } => Arc::new(HttpIpLookup::new(endpoint)?),
        };
        let documents = Arc::new(DocumentGenerator::new(
            TemplateRegistry::default(),
            onboard.signing_location.clone(),
        ));
        if documents.template(&onboard.template_id).is_none() {
            return Err(ServiceError::Config(format!(
                "unknown agreement template '{}'",
                onboard.template_id
            )));
        }

        let services = WorkflowServices {
            investors: investors.clone(),
            otp: OtpVerifier::new(provider.clone()),
            blobs,
            ip_lookup,
            documents,
            config: Arc::new(onboard),
        };

        let state = Self {
            sessions,
            provider,
            console: AdminReviewConsole::new(investors.clone()),
            gate: AccessGate::new(investors.clone()),
            investors,
            services,
            workflows: Arc::new(Mutex::new(HashMap::new())),
            workflow_idle,
            trusted_proxies: trusted_proxies.into(),
            storage_backend,
            log_otp_codes,
        };
        if let Some(admin) = admin {
            state.ensure_admin(&admin).await?;
        }
        Ok(state)
    }

    /// Create the admin account and record unless they already exist.
    pub async fn ensure_admin(&self, admin: &AdminBootstrap) -> Result<Identity, ServiceError> {
        let identity = match self.provider.create_account(&admin.email, &admin.password).await {
            Ok(identity) => identity,
            Err(OnboardError::Auth {
                failure: AuthFailure::DuplicateEmail,
                ..
            }) => {
                let session = self
                    .provider
                    .sign_in(&admin.email, &admin.password, SessionPersistence::Ephemeral)
                    .await?;
                self.provider.sign_out(&session.token).await?;
                session.identity
            }
            Err(err) => return Err(err.into()),
        };

        if self.investors.admins().get(&identity.uid).await?.is_none() {
            self.investors
                .admins()
                .upsert(&Admin {
                    uid: identity.uid.clone(),
                    email: identity.email.clone(),
                    name: admin.name.clone(),
                    role: AdminRole::Admin,
                    created_at: Utc::now(),
                })
                .await?;
            info!(uid = %identity.uid, email = %identity.email, "admin bootstrapped");
        }
        Ok(identity)
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, ApiError> {
        let token = bearer_token(headers).ok_or_else(|| {
            ApiError::Core(OnboardError::auth(
                AuthFailure::SessionExpired,
                "missing bearer token",
            ))
        })?;
        Ok(self.sessions.resolve(token).await?)
    }

    async fn authenticate_admin(&self, headers: &HeaderMap) -> Result<Identity, ApiError> {
        let identity = self.authenticate(headers).await?;
        self.investors.admins().require_admin(&identity.uid).await?;
        Ok(identity)
    }

    async fn workflow(&self, identity: &Identity) -> Result<Arc<Mutex<NdaWorkflow>>, ApiError> {
        {
            let now = Instant::now();
            let mut workflows = self.workflows.lock().await;
            workflows.retain(|uid, slot| {
                let live = now.duration_since(slot.touched) < self.workflow_idle;
                if !live {
                    debug!(uid = %uid, "idle signing session discarded");
                }
                live
            });
            if let Some(slot) = workflows.get_mut(&identity.uid) {
                slot.touched = now;
                return Ok(slot.workflow.clone());
            }
        }

        // Started without the map lock; a concurrent start for the same uid keeps the first.
        let started = NdaWorkflow::start(self.services.clone(), identity.clone()).await?;
        let mut workflows = self.workflows.lock().await;
        let slot = workflows
            .entry(identity.uid.clone())
            .or_insert_with(|| WorkflowSlot {
                workflow: Arc::new(Mutex::new(started)),
                touched: Instant::now(),
            });
        Ok(slot.workflow.clone())
    }

    async fn drop_workflow(&self, uid: &str) {
        self.workflows.lock().await.remove(uid);
    }
}

#[cfg(feature = "postgres")]
async fn connect_store(storage: StorageConfig) -> Result<Arc<dyn DocumentStore>, ServiceError> {
    match storage {
        StorageConfig::Memory => Ok(Arc::new(InMemoryDocumentStore::new())),
        StorageConfig::Postgres {
            database_url,
            max_connections,
        } => Ok(Arc::new(
            onboard_adapters::PostgresDocumentStore::connect(&database_url, max_connections)
                .await?,
        )),
    }
}

#[cfg(not(feature = "postgres"))]
async fn connect_store(storage: StorageConfig) -> Result<Arc<dyn DocumentStore>, ServiceError> {
    match storage {
        StorageConfig::Memory => Ok(Arc::new(InMemoryDocumentStore::new())),
        StorageConfig::Postgres { .. } => Err(ServiceError::Config(
            "postgres storage requires building with the `postgres` feature".to_string(),
        )),
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/accounts", post(create_account))
        .route("/v1/sessions", post(login).delete(logout))
        .route("/v1/me/route", get(my_route))
        .route("/v1/me/route/wait", get(wait_route))
        .route("/v1/onboarding", get(onboarding_view))
        .route("/v1/onboarding/accept", post(onboarding_accept))
        .route("/v1/onboarding/details", post(onboarding_details))
        .route("/v1/onboarding/phone", post(onboarding_phone))
        .route("/v1/onboarding/code", post(onboarding_code))
        .route("/v1/onboarding/signature", post(onboarding_signature))
        .route("/v1/onboarding/signature/clear", post(onboarding_clear_signature))
        .route("/v1/onboarding/commit", post(onboarding_commit))
        .route("/v1/onboarding/back", post(onboarding_back))
        .route("/v1/admin/investors", get(admin_list))
        .route("/v1/admin/investors/:uid", get(admin_detail))
        .route("/v1/admin/investors/:uid/approve", post(admin_approve))
        .route("/v1/admin/investors/:uid/reject", post(admin_reject))
        .with_state(state)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Signer address for the agreement record.
///
/// The TCP peer is authoritative. Forwarding headers are read only when the peer is a
/// trusted proxy: the rightmost `x-forwarded-for` hop that is not itself trusted wins,
/// then `x-real-ip`. `None` when the peer is unknown.
fn client_ip(peer: Option<IpAddr>, headers: &HeaderMap, trusted: &[IpAddr]) -> Option<IpAddr> {
    let peer = peer?;
    if !trusted.contains(&peer) {
        return Some(peer);
    }

    let hops: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .collect();
    for hop in hops.into_iter().rev() {
        match hop.parse::<IpAddr>() {
            Ok(ip) if trusted.contains(&ip) => continue,
            Ok(ip) => return Some(ip),
            // Anything left of a malformed hop was written by the client.
            Err(_) => break,
        }
    }

    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<IpAddr>().ok())
        .or(Some(peer))
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("onboarding error: {0}")]
    Core(#[from] OnboardError),
    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] OnboardError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

fn status_for(err: &OnboardError) -> StatusCode {
    match err {
        OnboardError::Validation(_) | OnboardError::Verification(_) => StatusCode::BAD_REQUEST,
        OnboardError::Auth { failure, .. } => match failure {
            AuthFailure::DuplicateEmail => StatusCode::CONFLICT,
            AuthFailure::WeakCredential => StatusCode::BAD_REQUEST,
            AuthFailure::InvalidCredential | AuthFailure::SessionExpired => {
                StatusCode::UNAUTHORIZED
            }
            AuthFailure::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AuthFailure::Unauthorized => StatusCode::FORBIDDEN,
        },
        OnboardError::Conflict(_) | OnboardError::StepOrder(_) => StatusCode::CONFLICT,
        OnboardError::NotFound(_) => StatusCode::NOT_FOUND,
        OnboardError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        OnboardError::Backend(_) => StatusCode::BAD_GATEWAY,
        OnboardError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn kind_of(err: &OnboardError) -> &'static str {
    match err {
        OnboardError::Validation(_) => "validation",
        OnboardError::Auth { failure, .. } => failure.name(),
        OnboardError::Verification(_) => "verification",
        OnboardError::Storage(_) => "storage",
        OnboardError::Conflict(_) => "conflict",
        OnboardError::StepOrder(_) => "step_order",
        OnboardError::NotFound(_) => "not_found",
        OnboardError::Backend(_) => "backend",
        OnboardError::Serialization(_) => "serialization",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Core(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    warn!(error = %err, "request failed");
                }
                (
                    status,
                    Json(serde_json::json!({
                        "error": err.user_message(),
                        "kind": kind_of(&err),
                    })),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
    blob_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "onboard-service",
        storage_backend: state.storage_backend,
        blob_backend: state.services.blobs.backend_label(),
    })
}

#[derive(Debug, Clone, Deserialize)]
struct SignupRequest {
    email: String,
    password: String,
    #[serde(flatten)]
    profile: Profile,
}

async fn create_account(
    State(state): State<ServiceState>,
    Json(request): Json<SignupRequest>,
) -> Result<(StatusCode, Json<Investor>), ApiError> {
    let investor = state
        .sessions
        .create_account(&request.email, &request.password, request.profile)
        .await?;
    Ok((StatusCode::CREATED, Json(investor)))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    email: String,
    password: String,
    #[serde(default = "default_remember")]
    remember_me: bool,
}

fn default_remember() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    token: String,
    uid: String,
    email: String,
    expires_at: DateTime<Utc>,
    route: Route,
}

async fn login(
    State(state): State<ServiceState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let persistence = if request.remember_me {
        SessionPersistence::Durable
    } else {
        SessionPersistence::Ephemeral
    };
    let session = state
        .sessions
        .login(&request.email, &request.password, persistence)
        .await?;
    let route = state.gate.route(Some(&session.identity)).await?;
    Ok(Json(LoginResponse {
        token: session.token,
        uid: session.identity.uid,
        email: session.identity.email,
        expires_at: session.expires_at,
        route,
    }))
}

async fn logout(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let identity = state.authenticate(&headers).await?;
    if let Some(token) = bearer_token(&headers) {
        state.sessions.revoke(token).await?;
    }
    state.drop_workflow(&identity.uid).await;
    info!(uid = %identity.uid, "signed out");
    Ok(StatusCode::NO_CONTENT)
}

async fn my_route(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<Route>, ApiError> {
    let identity = match bearer_token(&headers) {
        Some(token) => state.sessions.resolve(token).await.ok(),
        None => None,
    };
    Ok(Json(state.gate.route(identity.as_ref()).await?))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitQuery {
    known: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct WaitResponse {
    changed: bool,
    status: InvestorStatus,
    route: Route,
}

async fn wait_route(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<WaitQuery>,
) -> Result<Json<WaitResponse>, ApiError> {
    let identity = state.authenticate(&headers).await?;
    let known = match query.known.as_deref() {
        Some(raw) => raw.parse::<InvestorStatus>()?,
        None => state.investors.require(&identity.uid).await?.status,
    };
    let max_wait = state.services.config.max_wait;
    let timeout = query
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(max_wait)
        .min(max_wait);

    let changed = state
        .gate
        .wait_for_change(&identity.uid, known, timeout)
        .await?;
    let status = changed.unwrap_or(known);
    Ok(Json(WaitResponse {
        changed: changed.is_some(),
        status,
        route: Route::for_status(status),
    }))
}

async fn onboarding_view(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<WorkflowView>, ApiError> {
    let identity = state.authenticate(&headers).await?;
    let workflow = state.workflow(&identity).await?;
    let view = workflow.lock().await.view();
    Ok(Json(view))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcceptRequest {
    accepted: bool,
    #[serde(default)]
    read_to_end: bool,
}

async fn onboarding_accept(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<AcceptRequest>,
) -> Result<Json<WorkflowView>, ApiError> {
    let identity = state.authenticate(&headers).await?;
    let workflow = state.workflow(&identity).await?;
    let mut workflow = workflow.lock().await;
    workflow.record_read_progress(request.read_to_end);
    workflow.accept_terms(request.accepted)?;
    Ok(Json(workflow.view()))
}

async fn onboarding_details(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(form): Json<FillForm>,
) -> Result<Json<WorkflowView>, ApiError> {
    let identity = state.authenticate(&headers).await?;
    let workflow = state.workflow(&identity).await?;
    let mut workflow = workflow.lock().await;
    workflow.submit_details(form)?;
    Ok(Json(workflow.view()))
}

#[derive(Debug, Clone, Deserialize)]
struct PhoneRequest {
    phone: String,
}

async fn onboarding_phone(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<PhoneRequest>,
) -> Result<Json<WorkflowView>, ApiError> {
    let identity = state.authenticate(&headers).await?;
    let workflow = state.workflow(&identity).await?;
    let mut workflow = workflow.lock().await;
    workflow.request_code(&request.phone).await?;

    if state.log_otp_codes {
        if let Ok(phone) = normalize_phone(&request.phone) {
            if let Some(code) = state.provider.last_code_for(&phone) {
                info!(uid = %identity.uid, phone = %phone, code = %code, "development otp code");
            }
        }
    }
    Ok(Json(workflow.view()))
}

#[derive(Debug, Clone, Deserialize)]
struct CodeRequest {
    #[serde(default)]
    code: String,
}

async fn onboarding_code(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<CodeRequest>,
) -> Result<Json<WorkflowView>, ApiError> {
    let identity = state.authenticate(&headers).await?;
    let workflow = state.workflow(&identity).await?;
    let mut workflow = workflow.lock().await;
    workflow.confirm_code(&request.code).await?;
    Ok(Json(workflow.view()))
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct DisplayRect {
    left: f32,
    top: f32,
    width: f32,
    height: f32,
}

#[derive(Debug, Clone, Deserialize)]
struct SignatureRequest {
    display: Option<DisplayRect>,
    strokes: Vec<Vec<Point>>,
}

async fn onboarding_signature(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<SignatureRequest>,
) -> Result<Json<WorkflowView>, ApiError> {
    let identity = state.authenticate(&headers).await?;
    if request.strokes.iter().all(Vec::is_empty) {
        return Err(ApiError::bad_request("no strokes supplied"));
    }
    let transform = request
        .display
        .map(|rect| DisplayTransform::new(rect.left, rect.top, rect.width, rect.height))
        .transpose()?;

    let workflow = state.workflow(&identity).await?;
    let mut workflow = workflow.lock().await;
    for (i, stroke) in request.strokes.iter().enumerate() {
        let display = if i == 0 { transform } else { None };
        workflow.draw(display, stroke)?;
    }
    Ok(Json(workflow.view()))
}

async fn onboarding_clear_signature(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<WorkflowView>, ApiError> {
    let identity = state.authenticate(&headers).await?;
    let workflow = state.workflow(&identity).await?;
    let mut workflow = workflow.lock().await;
    workflow.clear_signature()?;
    Ok(Json(workflow.view()))
}

async fn onboarding_commit(
    State(state): State<ServiceState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Json<WorkflowView>, ApiError> {
    let identity = state.authenticate(&headers).await?;
    let workflow = state.workflow(&identity).await?;
    let peer = peer.map(|ConnectInfo(addr)| addr.ip());
    let ip = client_ip(peer, &headers, &state.trusted_proxies).map(|ip| ip.to_string());

    let view = {
        let mut workflow = workflow.lock().await;
        workflow.commit_with_ip(ip.as_deref()).await?;
        workflow.view()
    };
    // Signed; the record now drives routing.
    state.drop_workflow(&identity.uid).await;
    Ok(Json(view))
}

async fn onboarding_back(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<WorkflowView>, ApiError> {
    let identity = state.authenticate(&headers).await?;
    let workflow = state.workflow(&identity).await?;
    let mut workflow = workflow.lock().await;
    workflow.back()?;
    Ok(Json(workflow.view()))
}

#[derive(Debug, Clone, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

async fn admin_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Investor>>, ApiError> {
    state.authenticate_admin(&headers).await?;
    let filter = match query.status.as_deref() {
        Some(raw) => raw.parse::<StatusFilter>()?,
        None => StatusFilter::All,
    };
    Ok(Json(state.console.list(filter).await?))
}

async fn admin_detail(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(uid): Path<String>,
) -> Result<Json<InvestorDetail>, ApiError> {
    state.authenticate_admin(&headers).await?;
    Ok(Json(state.console.get(&uid).await?))
}

#[derive(Debug, Clone, Serialize)]
struct ReviewResponse {
    outcome: &'static str,
    investor: Investor,
}

impl From<ReviewOutcome> for ReviewResponse {
    fn from(outcome: ReviewOutcome) -> Self {
        match outcome {
            ReviewOutcome::Applied(investor) => Self {
                outcome: "applied",
                investor,
            },
            ReviewOutcome::AlreadyFinal(investor) => Self {
                outcome: "already_final",
                investor,
            },
        }
    }
}

async fn admin_approve(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(uid): Path<String>,
) -> Result<Json<ReviewResponse>, ApiError> {
    let admin = state.authenticate(&headers).await?;
    let outcome = state.console.approve(&uid, &admin.uid).await?;
    Ok(Json(outcome.into()))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RejectRequest {
    reason: Option<String>,
}

async fn admin_reject(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(uid): Path<String>,
    body: Option<Json<RejectRequest>>,
) -> Result<Json<ReviewResponse>, ApiError> {
    let admin = state.authenticate(&headers).await?;
    let reason = body.and_then(|Json(request)| request.reason);
    let outcome = state.console.reject(&uid, &admin.uid, reason).await?;
    Ok(Json(outcome.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const ADMIN_EMAIL: &str = "admin@x.com";
    const ADMIN_PASSWORD: &str = "adm1n-pass";

    async fn state_with(config: ServiceConfig) -> ServiceState {
        ServiceState::bootstrap(ServiceConfig {
            admin: Some(AdminBootstrap {
                email: ADMIN_EMAIL.to_string(),
                password: ADMIN_PASSWORD.to_string(),
                name: "Compliance".to_string(),
            }),
            fixed_otp_code: Some("482913".to_string()),
            ..config
        })
        .await
        .unwrap()
    }

    async fn app() -> Router {
        build_router(state_with(ServiceConfig::default()).await)
    }

    /// Drive a signed-up investor through to SIGN with a drawn signature.
    async fn ready_to_commit(app: &Router, token: &str) {
        let token = Some(token);
        for (uri, body) in [
            ("/v1/onboarding/accept", json!({ "accepted": true })),
            (
                "/v1/onboarding/details",
                json!({
                    "fullName": "Jane Doe",
                    "company": "Doe Capital",
                    "role": "Partner",
                    "nationality": "Portuguese",
                    "maritalStatus": "single",
                    "profession": "Engineer",
                    "address": "Rua Augusta 1, Lisboa",
                    "documentType": "passport",
                    "documentNumber": "P123456",
                    "taxId": "999888777"
                }),
            ),
            ("/v1/onboarding/phone", json!({ "phone": "+351900000000" })),
            ("/v1/onboarding/code", json!({ "code": "482913" })),
            (
                "/v1/onboarding/signature",
                json!({ "strokes": [[{ "x": 10.0, "y": 50.0 }, { "x": 220.0, "y": 80.0 }]] }),
            ),
        ] {
            let (status, body) = call(app, "POST", uri, token, Some(body)).await;
            assert_eq!(status, StatusCode::OK, "{uri}: {body}");
        }
    }

    async fn commit_from(
        app: &Router,
        token: &str,
        peer: [u8; 4],
        forwarded_for: &str,
    ) -> StatusCode {
        let request = Request::builder()
            .method("POST")
            .uri("/v1/onboarding/commit")
            .header("authorization", format!("Bearer {token}"))
            .header("x-forwarded-for", forwarded_for)
            .extension(ConnectInfo(SocketAddr::from((peer, 40_000))))
            .body(Body::empty())
            .unwrap();
        app.clone().oneshot(request).await.unwrap().status()
    }

    async fn signed_ip(state: &ServiceState, uid: &str) -> Option<String> {
        state.investors.require(uid).await.unwrap().nda_signed_ip
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn login(app: &Router, email: &str, password: &str) -> String {
        let (status, body) = call(
            app,
            "POST",
            "/v1/sessions",
            None,
            Some(json!({ "email": email, "password": password })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["token"].as_str().unwrap().to_string()
    }

    async fn signed_up_investor(app: &Router) -> (String, String) {
        let (status, body) = call(
            app,
            "POST",
            "/v1/accounts",
            None,
            Some(json!({
                "email": "investor@x.com",
                "password": "s3cretpass",
                "name": "Jane Doe",
                "company": "Doe Capital",
                "role": "Partner"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        let uid = body["uid"].as_str().unwrap().to_string();
        (uid, login(app, "investor@x.com", "s3cretpass").await)
    }

    #[tokio::test]
    async fn health_reports_backends() {
        let app = app().await;
        let (status, body) = call(&app, "GET", "/v1/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["storageBackend"], "memory");
        assert_eq!(body["blobBackend"], "memory");
    }

    #[tokio::test]
    async fn duplicate_signup_and_bad_login_map_to_http_statuses() {
        let app = app().await;
        signed_up_investor(&app).await;

        let (status, body) = call(
            &app,
            "POST",
            "/v1/accounts",
            None,
            Some(json!({ "email": "investor@x.com", "password": "s3cretpass" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "duplicate_email");

        let (status, _) = call(
            &app,
            "POST",
            "/v1/sessions",
            None,
            Some(json!({ "email": "investor@x.com", "password": "wrong-pass1" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn route_requires_a_live_session() {
        let app = app().await;
        let (status, body) = call(&app, "GET", "/v1/me/route", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["route"], "login");

        let (status, _) = call(&app, "GET", "/v1/onboarding", Some("bogus"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn onboarding_over_http_then_admin_approval() {
        let app = app().await;
        let (uid, token) = signed_up_investor(&app).await;
        let token = Some(token.as_str());

        let (_, route) = call(&app, "GET", "/v1/me/route", token, None).await;
        assert_eq!(route, json!({ "route": "onboarding", "step": "READ" }));

        let (status, view) = call(&app, "GET", "/v1/onboarding", token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["form"]["fullName"], "Jane Doe");

        let (status, _) = call(
            &app,
            "POST",
            "/v1/onboarding/accept",
            token,
            Some(json!({ "accepted": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &app,
            "POST",
            "/v1/onboarding/details",
            token,
            Some(json!({ "fullName": "Jane Doe", "company": "Doe Capital" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("taxId"));

        let (status, view) = call(
            &app,
            "POST",
            "/v1/onboarding/details",
            token,
            Some(json!({
                "fullName": "Jane Doe",
                "company": "Doe Capital",
                "role": "Partner",
                "nationality": "Portuguese",
                "maritalStatus": "single",
                "profession": "Engineer",
                "address": "Rua Augusta 1, Lisboa",
                "documentType": "passport",
                "documentNumber": "P123456",
                "taxId": "999888777"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["step"], "PHONE");

        call(
            &app,
            "POST",
            "/v1/onboarding/phone",
            token,
            Some(json!({ "phone": "+351900000000" })),
        )
        .await;
        let (status, view) = call(
            &app,
            "POST",
            "/v1/onboarding/code",
            token,
            Some(json!({ "code": "482913" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["step"], "SIGN");

        let (status, _) = call(&app, "POST", "/v1/onboarding/commit", token, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, view) = call(
            &app,
            "POST",
            "/v1/onboarding/signature",
            token,
            Some(json!({
                "display": { "left": 0.0, "top": 0.0, "width": 300.0, "height": 100.0 },
                "strokes": [[{ "x": 10.0, "y": 50.0 }, { "x": 120.0, "y": 30.0 }]]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["signatureEmpty"], false);

        let status = commit_from(&app, token.unwrap(), [198, 51, 100, 4], "10.9.9.9").await;
        assert_eq!(status, StatusCode::OK);

        let (_, route) = call(&app, "GET", "/v1/me/route", token, None).await;
        assert_eq!(route["route"], "pending_approval");

        // Investors cannot use the admin console.
        let (status, _) = call(&app, "GET", "/v1/admin/investors", token, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(
            &app,
            "POST",
            &format!("/v1/admin/investors/{uid}/approve"),
            token,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let admin = login(&app, ADMIN_EMAIL, ADMIN_PASSWORD).await;
        let admin = Some(admin.as_str());
        let (status, list) = call(
            &app,
            "GET",
            "/v1/admin/investors?status=pending_approval",
            admin,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (_, detail) = call(
            &app,
            "GET",
            &format!("/v1/admin/investors/{uid}"),
            admin,
            None,
        )
        .await;
        assert_eq!(detail["investor"]["ndaSignedIp"], "198.51.100.4");

        let (status, review) = call(
            &app,
            "POST",
            &format!("/v1/admin/investors/{uid}/approve"),
            admin,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(review["outcome"], "applied");

        let (_, again) = call(
            &app,
            "POST",
            &format!("/v1/admin/investors/{uid}/reject"),
            admin,
            Some(json!({ "reason": "late" })),
        )
        .await;
        assert_eq!(again["outcome"], "already_final");
        assert_eq!(again["investor"]["status"], "approved");

        let (_, waited) = call(
            &app,
            "GET",
            "/v1/me/route/wait?known=pending_approval&timeoutSecs=1",
            token,
            None,
        )
        .await;
        assert_eq!(waited["changed"], true);
        assert_eq!(waited["route"]["route"], "investor_area");
    }

    #[tokio::test]
    async fn filesystem_blobs_are_used_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let state = ServiceState::bootstrap(ServiceConfig {
            blobs: BlobConfig::Filesystem {
                root: dir.path().to_path_buf(),
                base_url: "http://localhost:8093/files".to_string(),
            },
            ..ServiceConfig::default()
        })
        .await
        .unwrap();
        let app = build_router(state);
        let (_, body) = call(&app, "GET", "/v1/health", None, None).await;
        assert_eq!(body["blobBackend"], "filesystem");
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn postgres_storage_needs_the_feature() {
        let result = ServiceState::bootstrap(ServiceConfig {
            storage: StorageConfig::Postgres {
                database_url: "postgres://127.0.0.1:1/none".to_string(),
                max_connections: 1,
            },
            ..ServiceConfig::default()
        })
        .await;
        assert!(matches!(result, Err(ServiceError::Config(_))));
    }

    #[tokio::test]
    async fn forwarded_for_from_an_untrusted_peer_is_ignored() {
        let state = state_with(ServiceConfig::default()).await;
        let app = build_router(state.clone());
        let (uid, token) = signed_up_investor(&app).await;
        ready_to_commit(&app, &token).await;

        let status = commit_from(&app, &token, [203, 0, 113, 20], "1.2.3.4").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(signed_ip(&state, &uid).await.as_deref(), Some("203.0.113.20"));
    }

    #[tokio::test]
    async fn trusted_proxy_passes_the_client_address() {
        let state = state_with(ServiceConfig {
            trusted_proxies: vec!["10.0.0.1".parse().unwrap()],
            ..ServiceConfig::default()
        })
        .await;
        let app = build_router(state.clone());
        let (uid, token) = signed_up_investor(&app).await;
        ready_to_commit(&app, &token).await;

        // The client prepended a fake hop; the proxy appended the real one.
        let status = commit_from(&app, &token, [10, 0, 0, 1], "1.2.3.4, 198.51.100.7").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(signed_ip(&state, &uid).await.as_deref(), Some("198.51.100.7"));
    }

    #[tokio::test]
    async fn commit_without_peer_address_records_unknown() {
        let state = state_with(ServiceConfig::default()).await;
        let app = build_router(state.clone());
        let (uid, token) = signed_up_investor(&app).await;
        ready_to_commit(&app, &token).await;

        let (status, view) = call(&app, "POST", "/v1/onboarding/commit", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["step"], "SUCCESS");
        assert_eq!(signed_ip(&state, &uid).await.as_deref(), Some("unknown"));
    }

    #[test]
    fn client_ip_walks_forwarded_hops_from_the_right() {
        let proxy: IpAddr = "10.0.0.1".parse().unwrap();
        let inner: IpAddr = "10.0.0.2".parse().unwrap();
        let trusted = [proxy, inner];
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "6.6.6.6, 198.51.100.7, 10.0.0.1".parse().unwrap());

        assert_eq!(client_ip(None, &headers, &trusted), None);
        assert_eq!(
            client_ip(Some(inner), &headers, &trusted),
            Some("198.51.100.7".parse().unwrap())
        );
        let stranger: IpAddr = "203.0.113.9".parse().unwrap();
        assert_eq!(client_ip(Some(stranger), &headers, &trusted), Some(stranger));

        // A malformed hop stops the walk; nothing left of it is believed.
        headers.insert("x-forwarded-for", "6.6.6.6, not-an-ip".parse().unwrap());
        headers.insert("x-real-ip", "198.51.100.8".parse().unwrap());
        assert_eq!(
            client_ip(Some(proxy), &headers, &trusted),
            Some("198.51.100.8".parse().unwrap())
        );
        headers.remove("x-real-ip");
        assert_eq!(client_ip(Some(proxy), &headers, &trusted), Some(proxy));
    }

    #[tokio::test]
    async fn signing_sessions_are_released_after_commit() {
        let state = state_with(ServiceConfig::default()).await;
        let app = build_router(state.clone());
        let (_, token) = signed_up_investor(&app).await;
        ready_to_commit(&app, &token).await;
        assert_eq!(state.workflows.lock().await.len(), 1);

        let status = commit_from(&app, &token, [203, 0, 113, 20], "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.workflows.lock().await.is_empty());

        // The signed record no longer admits a signing session.
        let (status, _) = call(&app, "GET", "/v1/onboarding", Some(&token), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(state.workflows.lock().await.is_empty());
    }

    #[tokio::test]
    async fn idle_signing_sessions_are_discarded() {
        let state = state_with(ServiceConfig {
            workflow_idle: Duration::from_millis(50),
            ..ServiceConfig::default()
        })
        .await;
        let app = build_router(state.clone());
        let (_, token) = signed_up_investor(&app).await;
        let token = Some(token.as_str());

        let (_, view) = call(
            &app,
            "POST",
            "/v1/onboarding/accept",
            token,
            Some(json!({ "accepted": true })),
        )
        .await;
        assert_eq!(view["step"], "FILL");

        tokio::time::sleep(Duration::from_millis(120)).await;
        let (status, view) = call(&app, "GET", "/v1/onboarding", token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["step"], "READ");
        assert_eq!(state.workflows.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn accounts_are_kept_in_the_document_store() {
        let state = state_with(ServiceConfig::default()).await;
        let app = build_router(state.clone());
        signed_up_investor(&app).await;

        let stored = state
            .services
            .investors
            .store()
            .get(onboard_core::Collection::Accounts, "investor@x.com")
            .await
            .unwrap();
        assert!(stored.is_some());
    }
}
