//! HTTP request handlers
//!
//! REST endpoints for the dispatcher console (`/servicehub`) and the client
//! directory and reporting (`/api`).

use actix_web::{web, HttpRequest, HttpResponse, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::alerts::{self, AssignClientRequest, DispatcherRef, NoteRequest, ResolveRequest};
use crate::dashboard;
use crate::error::AppError;
use crate::escalation::{AmbulanceRequest, ParticipantInput};
use crate::models::{
    AlertInput, AlertStatus, ClientInput, ContactInput, DeviceInput, DeviceSignal,
    DispatcherInput, DispatcherStatus, HealthCheck, MedicationInput,
};
use crate::reporting;
use crate::state::AppState;
use crate::store::load_emergency_info;
use crate::validation::{
    require_phone, validate_client_input, validate_contact_input, validate_dispatcher_input,
    validate_input, validate_pagination, validate_phone, validate_sms_text,
};

/// Configure all application routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    // malformed bodies and queries use the same JSON error format
    cfg.app_data(
        web::JsonConfig::default()
            .error_handler(|err, _req| AppError::BadRequest(err.to_string()).into()),
    )
    .app_data(
        web::QueryConfig::default()
            .error_handler(|err, _req| AppError::BadRequest(err.to_string()).into()),
    )
    .service(
        web::scope("/servicehub")
            .route("/dashboard", web::get().to(get_dashboard))
            // Alert lifecycle
            .route("/alerts", web::get().to(list_alerts))
            .route("/alerts", web::post().to(create_alert))
            .route("/alerts/{id}", web::get().to(get_alert))
            .route("/alerts/{id}/acknowledge", web::post().to(acknowledge_alert))
            .route("/alerts/{id}/resolve", web::post().to(resolve_alert))
            .route("/alerts/{id}/notes", web::post().to(add_alert_note))
            .route("/alerts/{id}/client", web::post().to(assign_alert_client))
            // Escalation chain
            .route("/alerts/{id}/escalation", web::get().to(get_escalation))
            .route("/alerts/{id}/escalation/family", web::post().to(notify_family))
            .route("/alerts/{id}/escalation/doctor", web::post().to(notify_doctor))
            .route("/alerts/{id}/escalation/ambulance", web::post().to(call_ambulance))
            .route(
                "/alerts/{id}/escalation/medications",
                web::post().to(provide_medications),
            )
            .route(
                "/alerts/{id}/escalation/conference/start",
                web::post().to(start_conference),
            )
            .route(
                "/alerts/{id}/escalation/conference/participants",
                web::post().to(add_conference_participant),
            )
            .route(
                "/alerts/{id}/escalation/conference/end",
                web::post().to(end_conference),
            )
            // Devices
            .route("/devices/{id}/signal", web::post().to(device_signal))
            // Call control
            .route("/calls/initiate", web::post().to(initiate_call))
            .route("/calls/active", web::get().to(active_calls))
            .route("/calls/{call_id}/hangup", web::post().to(hangup_call))
            .route("/calls/{call_id}/hold", web::post().to(hold_call))
            .route("/calls/{call_id}/resume", web::post().to(resume_call))
            .route("/calls/{call_id}/mute", web::post().to(mute_call))
            .route("/sms", web::post().to(send_sms))
            // Dispatchers and softphones
            .route("/dispatchers", web::get().to(list_dispatchers))
            .route("/dispatchers", web::post().to(create_dispatcher))
            .route("/dispatchers/{id}/status", web::put().to(set_dispatcher_status))
            .route("/softphone/{id}", web::get().to(get_softphone))
            .route("/softphone/{id}/connect", web::post().to(connect_softphone))
            .route("/softphone/{id}/disconnect", web::post().to(disconnect_softphone)),
    )
    .service(
        web::scope("/api")
            .route("/health", web::get().to(health_check))
            // Client directory
            .route("/clients", web::get().to(list_clients))
            .route("/clients", web::post().to(create_client))
            .route("/clients/{id}", web::get().to(get_client))
            .route("/clients/{id}/emergency-info", web::get().to(get_emergency_info))
            .route("/clients/{id}/contacts", web::get().to(list_contacts))
            .route("/clients/{id}/contacts", web::post().to(create_contact))
            .route("/clients/{id}/medications", web::get().to(list_medications))
            .route("/clients/{id}/medications", web::post().to(create_medication))
            .route("/devices", web::get().to(list_devices))
            .route("/devices", web::post().to(create_device))
            // Reporting
            .route("/reports/kpis", web::get().to(get_kpis)),
    );
}

fn dispatcher_of(body: Option<web::Json<DispatcherRef>>) -> Option<Uuid> {
    body.and_then(|b| b.dispatcher_id)
}

/// Health check endpoint
///
/// GET /api/health
pub async fn health_check(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let health = HealthCheck {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
        uptime_seconds: state.uptime_seconds(),
        gateway_configured: state.gateway_configured(),
    };

    Ok(HttpResponse::Ok().json(health))
}

/// GET /servicehub/dashboard
pub async fn get_dashboard(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let snapshot = dashboard::snapshot(
        state.repo.as_ref(),
        state.gateway.as_ref(),
        &state.softphones,
        &state.settings.dashboard,
    )
    .await?;
    Ok(HttpResponse::Ok().json(snapshot))
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Query parameters for the alert list
#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    pub status: Option<AlertStatus>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PaginatedResponse<T> {
    data: Vec<T>,
    page: u32,
    limit: u32,
    total: u32,
    total_pages: u32,
}

/// GET /servicehub/alerts?status=New&page=1&limit=50
pub async fn list_alerts(
    state: web::Data<AppState>,
    query: web::Query<AlertQuery>,
) -> Result<HttpResponse, AppError> {
    let (page, limit) = validate_pagination(query.page, query.limit)?;
    let alerts = alerts::list_alerts(state.repo.as_ref(), query.status).await?;

    let total = alerts.len();
    let start = (page as usize - 1).saturating_mul(limit as usize);
    let data: Vec<_> = alerts.into_iter().skip(start).take(limit as usize).collect();

    Ok(HttpResponse::Ok().json(PaginatedResponse {
        data,
        page,
        limit,
        total: total as u32,
        total_pages: total.div_ceil(limit as usize) as u32,
    }))
}

/// Manual alert entry
///
/// POST /servicehub/alerts
pub async fn create_alert(
    state: web::Data<AppState>,
    body: web::Json<AlertInput>,
    req: HttpRequest,
) -> Result<HttpResponse, AppError> {
    let correlation_id = extract_correlation_id(&req);
    info!(correlation_id = %correlation_id, alert_type = ?body.alert_type, "Received manual alert");

    validate_input(&*body)?;
    validate_phone("callerNumber", body.caller_number.as_deref())?;

    let alert = alerts::raise_alert(state.repo.as_ref(), body.into_inner()).await?;
    Ok(HttpResponse::Created().json(alert))
}

/// GET /servicehub/alerts/{id}
pub async fn get_alert(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let alert = alerts::get_alert(state.repo.as_ref(), path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(alert))
}

/// POST /servicehub/alerts/{id}/acknowledge
pub async fn acknowledge_alert(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: Option<web::Json<DispatcherRef>>,
) -> Result<HttpResponse, AppError> {
    let change =
        alerts::acknowledge(state.repo.as_ref(), path.into_inner(), dispatcher_of(body)).await?;
    Ok(HttpResponse::Ok().json(change))
}

/// POST /servicehub/alerts/{id}/resolve
pub async fn resolve_alert(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<ResolveRequest>,
) -> Result<HttpResponse, AppError> {
    validate_input(&*body)?;
    let change = alerts::resolve(state.repo.as_ref(), path.into_inner(), body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(change))
}

/// POST /servicehub/alerts/{id}/notes
pub async fn add_alert_note(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<NoteRequest>,
) -> Result<HttpResponse, AppError> {
    validate_input(&*body)?;
    let alert = alerts::add_note(state.repo.as_ref(), path.into_inner(), &body.note).await?;
    Ok(HttpResponse::Ok().json(alert))
}

/// POST /servicehub/alerts/{id}/client
pub async fn assign_alert_client(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<AssignClientRequest>,
) -> Result<HttpResponse, AppError> {
    let change =
        alerts::assign_client(state.repo.as_ref(), path.into_inner(), body.client_id).await?;
    Ok(HttpResponse::Ok().json(change))
}

/// POST /servicehub/devices/{id}/signal
pub async fn device_signal(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<DeviceSignal>,
) -> Result<HttpResponse, AppError> {
    validate_input(&*body)?;
    let alert =
        alerts::raise_from_device(state.repo.as_ref(), path.into_inner(), body.into_inner())
            .await?;
    Ok(HttpResponse::Created().json(alert))
}

// ---------------------------------------------------------------------------
// Escalation chain
// ---------------------------------------------------------------------------

/// Polled by the console while an alert is open
///
/// GET /servicehub/alerts/{id}/escalation
pub async fn get_escalation(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let status = state.orchestrator.full_status(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(status))
}

pub async fn notify_family(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: Option<web::Json<DispatcherRef>>,
) -> Result<HttpResponse, AppError> {
    let result = state
        .orchestrator
        .notify_family(path.into_inner(), dispatcher_of(body))
        .await?;
    Ok(HttpResponse::Ok().json(result))
}

pub async fn notify_doctor(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: Option<web::Json<DispatcherRef>>,
) -> Result<HttpResponse, AppError> {
    let result = state
        .orchestrator
        .notify_doctor(path.into_inner(), dispatcher_of(body))
        .await?;
    Ok(HttpResponse::Ok().json(result))
}

pub async fn call_ambulance(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: Option<web::Json<AmbulanceRequest>>,
) -> Result<HttpResponse, AppError> {
    let request = body.map(web::Json::into_inner).unwrap_or_default();
    validate_input(&request)?;
    validate_phone("ambulanceNumber", request.ambulance_number.as_deref())?;

    let result = state
        .orchestrator
        .call_ambulance(path.into_inner(), request)
        .await?;
    Ok(HttpResponse::Ok().json(result))
}

pub async fn provide_medications(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: Option<web::Json<DispatcherRef>>,
) -> Result<HttpResponse, AppError> {
    let result = state
        .orchestrator
        .provide_medication_list(path.into_inner(), dispatcher_of(body))
        .await?;
    Ok(HttpResponse::Ok().json(result))
}

fn validate_participant(participant: &ParticipantInput) -> Result<(), AppError> {
    validate_input(participant)?;
    require_phone("phone", &participant.phone)
}

pub async fn start_conference(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<ParticipantInput>,
) -> Result<HttpResponse, AppError> {
    validate_participant(&body)?;
    let result = state
        .orchestrator
        .start_conference(path.into_inner(), body.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(result))
}

pub async fn add_conference_participant(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<ParticipantInput>,
) -> Result<HttpResponse, AppError> {
    validate_participant(&body)?;
    let result = state
        .orchestrator
        .add_to_conference(path.into_inner(), body.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(result))
}

pub async fn end_conference(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: Option<web::Json<DispatcherRef>>,
) -> Result<HttpResponse, AppError> {
    let result = state
        .orchestrator
        .end_conference(path.into_inner(), dispatcher_of(body))
        .await?;
    Ok(HttpResponse::Ok().json(result))
}

// ---------------------------------------------------------------------------
// Call control
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct InitiateCallRequest {
    #[validate(length(min = 1, max = 32))]
    pub callee_number: String,
    pub dispatcher_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct MuteRequest {
    pub muted: bool,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct SmsRequest {
    #[validate(length(min = 1, max = 32))]
    pub recipient: String,
    pub message: String,
}

/// POST /servicehub/calls/initiate
pub async fn initiate_call(
    state: web::Data<AppState>,
    body: web::Json<InitiateCallRequest>,
) -> Result<HttpResponse, AppError> {
    validate_input(&*body)?;
    require_phone("calleeNumber", &body.callee_number)?;

    let result = state
        .softphones
        .initiate_call(body.dispatcher_id, &body.callee_number)
        .await?;
    Ok(HttpResponse::Ok().json(result))
}

/// GET /servicehub/calls/active
pub async fn active_calls(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let calls = state
        .gateway
        .active_calls()
        .await
        .map_err(|e| AppError::GatewayError(e.to_string()))?;
    Ok(HttpResponse::Ok().json(calls))
}

pub async fn hangup_call(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let result = state.softphones.hangup(&path).await?;
    Ok(HttpResponse::Ok().json(result))
}

pub async fn hold_call(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let result = state.softphones.hold(&path, true).await?;
    Ok(HttpResponse::Ok().json(result))
}

pub async fn resume_call(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let result = state.softphones.hold(&path, false).await?;
    Ok(HttpResponse::Ok().json(result))
}

/// Body is optional; mutes when absent
pub async fn mute_call(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: Option<web::Json<MuteRequest>>,
) -> Result<HttpResponse, AppError> {
    let muted = body.map(|b| b.muted).unwrap_or(true);
    let result = state.softphones.mute(&path, muted).await?;
    Ok(HttpResponse::Ok().json(result))
}

/// POST /servicehub/sms
pub async fn send_sms(
    state: web::Data<AppState>,
    body: web::Json<SmsRequest>,
) -> Result<HttpResponse, AppError> {
    validate_input(&*body)?;
    require_phone("recipient", &body.recipient)?;
    validate_sms_text(&body.message)?;

    let outcome = state.gateway.send_sms(&body.recipient, &body.message).await;
    info!(success = outcome.success, "Manual SMS sent");
    Ok(HttpResponse::Ok().json(outcome))
}

// ---------------------------------------------------------------------------
// Dispatchers and softphones
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: DispatcherStatus,
}

pub async fn list_dispatchers(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(state.repo.list_dispatchers().await?))
}

pub async fn create_dispatcher(
    state: web::Data<AppState>,
    body: web::Json<DispatcherInput>,
) -> Result<HttpResponse, AppError> {
    validate_dispatcher_input(&body)?;
    let dispatcher = state.repo.insert_dispatcher(body.into_inner().into()).await?;
    info!(dispatcher_id = %dispatcher.id, "Dispatcher created");
    Ok(HttpResponse::Created().json(dispatcher))
}

/// PUT /servicehub/dispatchers/{id}/status
pub async fn set_dispatcher_status(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<StatusUpdate>,
) -> Result<HttpResponse, AppError> {
    let dispatcher = state
        .repo
        .set_dispatcher_status(path.into_inner(), body.status)
        .await?;
    Ok(HttpResponse::Ok().json(dispatcher))
}

pub async fn get_softphone(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(state.softphones.session(path.into_inner()).await?))
}

pub async fn connect_softphone(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(state.softphones.connect(path.into_inner()).await?))
}

pub async fn disconnect_softphone(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(state.softphones.disconnect(path.into_inner()).await?))
}

// ---------------------------------------------------------------------------
// Client directory
// ---------------------------------------------------------------------------

pub async fn list_clients(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(state.repo.list_clients().await?))
}

/// POST /api/clients
pub async fn create_client(
    state: web::Data<AppState>,
    body: web::Json<ClientInput>,
) -> Result<HttpResponse, AppError> {
    validate_client_input(&body)?;
    let client = state.repo.insert_client(body.into_inner().into()).await?;
    info!(client_id = %client.id, "Client created");
    Ok(HttpResponse::Created().json(client))
}

pub async fn get_client(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    let client = state
        .repo
        .get_client(id)
        .await?
        .ok_or_else(|| AppError::client_not_found(id))?;
    Ok(HttpResponse::Ok().json(client))
}

/// GET /api/clients/{id}/emergency-info
pub async fn get_emergency_info(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let info = load_emergency_info(state.repo.as_ref(), path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(info))
}

async fn ensure_client(state: &AppState, id: Uuid) -> Result<(), AppError> {
    match state.repo.get_client(id).await? {
        Some(_) => Ok(()),
        None => Err(AppError::client_not_found(id)),
    }
}

pub async fn list_contacts(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    ensure_client(&state, id).await?;
    Ok(HttpResponse::Ok().json(state.repo.list_contacts(id).await?))
}

pub async fn create_contact(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<ContactInput>,
) -> Result<HttpResponse, AppError> {
    validate_contact_input(&body)?;
    let contact = state
        .repo
        .insert_contact(body.into_inner().into_contact(path.into_inner()))
        .await?;
    Ok(HttpResponse::Created().json(contact))
}

pub async fn list_medications(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    ensure_client(&state, id).await?;
    Ok(HttpResponse::Ok().json(state.repo.list_medications(id).await?))
}

pub async fn create_medication(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<MedicationInput>,
) -> Result<HttpResponse, AppError> {
    validate_input(&*body)?;
    let medication = state
        .repo
        .insert_medication(body.into_inner().into_medication(path.into_inner()))
        .await?;
    Ok(HttpResponse::Created().json(medication))
}

pub async fn list_devices(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(state.repo.list_devices().await?))
}

pub async fn create_device(
    state: web::Data<AppState>,
    body: web::Json<DeviceInput>,
) -> Result<HttpResponse, AppError> {
    validate_input(&*body)?;
    let device = state.repo.insert_device(body.into_inner().into()).await?;
    Ok(HttpResponse::Created().json(device))
}

/// GET /api/reports/kpis
pub async fn get_kpis(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(reporting::kpi_report(state.repo.as_ref()).await?))
}

/// Extract or generate correlation ID from request headers
fn extract_correlation_id(req: &HttpRequest) -> String {
    req.headers()
        .get("X-Correlation-ID")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
