use std::sync::Arc;

use actix_web::{HttpResponse, Responder, get, post, web};
use serde::{Deserialize, Serialize};

use crate::app::controller::{ControllerError, SessionController, StartRequest};
use crate::app::services::{
    DeviceQueryHandler, DiagnosticsQueryHandler, ServiceError, SqliteSessionStore,
};
use crate::domain::models::{DeviceSummary, Session, StopReason};

#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<SessionController>,
    pub diagnostics: SqliteSessionStore,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub transaction_id: String,
    pub device_id: String,
    #[serde(alias = "amountPaid")]
    pub budget_currency: f64,
    #[serde(default, rename = "energyCapKWh", alias = "energySelected")]
    pub energy_cap_kwh: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopSessionRequest {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLookupQuery {
    pub transaction_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DiagnosticsLogQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub transaction_id: String,
    pub session_id: String,
    pub device_id: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    #[serde(rename = "cumulativeEnergyKWh")]
    pub cumulative_energy_kwh: f64,
    #[serde(rename = "cumulativeCostCurrency")]
    pub cumulative_cost: f64,
    pub relay_state: &'static str,
    #[serde(rename = "budgetCurrency")]
    pub budget: f64,
    #[serde(rename = "energyCapKWh")]
    pub energy_cap_kwh: f64,
    #[serde(rename = "ratePerKWh")]
    pub rate_per_kwh: f64,
    pub status: &'static str,
    pub stop_reason: Option<&'static str>,
    pub last_voltage: Option<f64>,
    pub last_current: Option<f64>,
    pub last_sample_at: Option<String>,
    pub last_power_w: Option<f64>,
    pub actuator_error: Option<String>,
    pub updated_at: String,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            transaction_id: session.transaction_id,
            session_id: session.session_id,
            device_id: session.device_id,
            started_at: session.started_at,
            ended_at: session.ended_at,
            cumulative_energy_kwh: session.cumulative_energy_kwh,
            cumulative_cost: session.cumulative_cost,
            relay_state: session.relay_state.as_str(),
            budget: session.budget,
            energy_cap_kwh: session.energy_cap_kwh,
            rate_per_kwh: session.rate_per_kwh,
            status: session.status.as_str(),
            stop_reason: session.stop_reason.map(StopReason::as_str),
            last_voltage: session.last_voltage,
            last_current: session.last_current,
            last_sample_at: session.last_sample_at,
            last_power_w: session.last_power_w,
            actuator_error: session.actuator_error,
            updated_at: session.updated_at,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResponse {
    pub device_id: String,
    pub session_count: i64,
    pub latest_session_id: String,
    pub latest_status: &'static str,
    pub latest_started_at: String,
    pub last_sample_at: Option<String>,
    pub last_power_w: Option<f64>,
    pub active_session_id: Option<String>,
}

impl From<DeviceSummary> for DeviceResponse {
    fn from(device: DeviceSummary) -> Self {
        Self {
            device_id: device.device_id,
            session_count: device.session_count,
            latest_session_id: device.latest_session_id,
            latest_status: device.latest_status.as_str(),
            latest_started_at: device.latest_started_at,
            last_sample_at: device.last_sample_at,
            last_power_w: device.last_power_w,
            active_session_id: device.active_session_id,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsResponse {
    pub schema_version: u32,
    pub sessions_count: i64,
    pub log_events_count: i64,
    pub live_sessions: usize,
    pub stale_samples_dropped: u64,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsLogEventResponse {
    pub id: String,
    pub created_at: String,
    pub level: String,
    pub code: String,
    pub message: String,
    pub session_id: Option<String>,
    pub device_id: Option<String>,
    pub details_json: Option<String>,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(start_session_endpoint)
        .service(stop_session_endpoint)
        .service(find_session_endpoint)
        .service(get_session_endpoint)
        .service(list_devices_endpoint)
        .service(get_device_endpoint)
        .service(get_diagnostics_endpoint)
        .service(list_log_events_diagnostics_endpoint);
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[post("/api/sessions/start")]
async fn start_session_endpoint(
    state: web::Data<ApiState>,
    body: web::Json<StartSessionRequest>,
) -> HttpResponse {
    let body = body.into_inner();
    let request = StartRequest {
        transaction_id: body.transaction_id,
        device_id: body.device_id,
        budget: body.budget_currency,
        energy_cap_kwh: body.energy_cap_kwh,
    };

    let controller = Arc::clone(&state.controller);
    match web::block(move || controller.start(request)).await {
        Ok(Ok(session)) => HttpResponse::Ok().json(SessionResponse::from(session)),
        Ok(Err(error)) => controller_error_response(error),
        Err(error) => blocking_error_response(error),
    }
}

#[post("/api/sessions/stop")]
async fn stop_session_endpoint(
    state: web::Data<ApiState>,
    body: web::Json<StopSessionRequest>,
) -> HttpResponse {
    let session_id = body.into_inner().session_id;
    let controller = Arc::clone(&state.controller);

    match web::block(move || controller.stop(&session_id, StopReason::UserRequested)).await {
        Ok(Ok(session)) => HttpResponse::Ok().json(SessionResponse::from(session)),
        Ok(Err(error)) => controller_error_response(error),
        Err(error) => blocking_error_response(error),
    }
}

#[get("/api/sessions")]
async fn find_session_endpoint(
    state: web::Data<ApiState>,
    query: web::Query<SessionLookupQuery>,
) -> HttpResponse {
    let Some(transaction_id) = query
        .into_inner()
        .transaction_id
        .filter(|value| !value.trim().is_empty())
    else {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "InvalidRequest",
            "message": "transactionId query parameter is required"
        }));
    };

    match state.controller.get_by_transaction_id(&transaction_id) {
        Ok(session) => HttpResponse::Ok().json(SessionResponse::from(session)),
        Err(error) => controller_error_response(error),
    }
}

#[get("/api/sessions/{session_id}")]
async fn get_session_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<String>,
) -> HttpResponse {
    match state.controller.get_by_session_id(&path.into_inner()) {
        Ok(session) => HttpResponse::Ok().json(SessionResponse::from(session)),
        Err(error) => controller_error_response(error),
    }
}

#[get("/api/devices")]
async fn list_devices_endpoint(state: web::Data<ApiState>) -> HttpResponse {
    match state.diagnostics.list_devices() {
        Ok(devices) => {
            let mapped: Vec<DeviceResponse> =
                devices.into_iter().map(DeviceResponse::from).collect();
            HttpResponse::Ok().json(mapped)
        }
        Err(error) => service_error_response(error),
    }
}

#[get("/api/devices/{device_id}")]
async fn get_device_endpoint(state: web::Data<ApiState>, path: web::Path<String>) -> HttpResponse {
    let device_id = path.into_inner();
    match state.diagnostics.get_device(&device_id) {
        Ok(Some(device)) => HttpResponse::Ok().json(DeviceResponse::from(device)),
        Ok(None) => HttpResponse::NotFound().json(error_body(
            "NotFound",
            &format!("device not found: {device_id}"),
        )),
        Err(error) => service_error_response(error),
    }
}

#[get("/diagnostics")]
async fn get_diagnostics_endpoint(state: web::Data<ApiState>) -> HttpResponse {
    let schema_version = match state.diagnostics.get_schema_version() {
        Ok(value) => value,
        Err(error) => return service_error_response(error),
    };
    let sessions_count = match state.diagnostics.count_sessions() {
        Ok(value) => value,
        Err(error) => return service_error_response(error),
    };
    let log_events_count = match state.diagnostics.count_log_events() {
        Ok(value) => value,
        Err(error) => return service_error_response(error),
    };
    let live = state.controller.diagnostics();

    HttpResponse::Ok().json(DiagnosticsResponse {
        schema_version,
        sessions_count,
        log_events_count,
        live_sessions: live.live_sessions,
        stale_samples_dropped: live.stale_samples_dropped,
    })
}

#[get("/diagnostics/log-events")]
async fn list_log_events_diagnostics_endpoint(
    state: web::Data<ApiState>,
    query: web::Query<DiagnosticsLogQuery>,
) -> HttpResponse {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    match state.diagnostics.list_recent_log_events(limit) {
        Ok(events) => {
            let mapped: Vec<DiagnosticsLogEventResponse> = events
                .into_iter()
                .map(|event| DiagnosticsLogEventResponse {
                    id: event.id,
                    created_at: event.created_at,
                    level: event.level,
                    code: event.code,
                    message: event.message,
                    session_id: event.session_id,
                    device_id: event.device_id,
                    details_json: event.details_json,
                })
                .collect();
            HttpResponse::Ok().json(mapped)
        }
        Err(error) => service_error_response(error),
    }
}

fn controller_error_response(error: ControllerError) -> HttpResponse {
    let message = error.to_string();
    match error {
        ControllerError::InvalidRequest(_) => {
            HttpResponse::BadRequest().json(error_body("InvalidRequest", &message))
        }
        ControllerError::DuplicateTransaction(_) => {
            HttpResponse::BadRequest().json(error_body("DuplicateTransaction", &message))
        }
        ControllerError::ActuatorUnavailable { .. } => {
            HttpResponse::BadGateway().json(error_body("ActuatorUnavailable", &message))
        }
        ControllerError::TelemetryUnavailable { .. } => {
            HttpResponse::BadGateway().json(error_body("TelemetryUnavailable", &message))
        }
        ControllerError::Cancelled(_) => {
            HttpResponse::Conflict().json(error_body("Cancelled", &message))
        }
        ControllerError::NotFound(_) => {
            HttpResponse::NotFound().json(error_body("NotFound", &message))
        }
        ControllerError::Store(error) => service_error_response(error),
        ControllerError::LockPoisoned => {
            tracing::error!("controller state lock poisoned");
            HttpResponse::InternalServerError().json(error_body("Internal", &message))
        }
    }
}

fn service_error_response(error: ServiceError) -> HttpResponse {
    tracing::error!(error = %error, "session store request failed");
    match error {
        ServiceError::DbLockPoisoned => {
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "database lock poisoned"
            }))
        }
        ServiceError::Database(error) => {
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": format!("database query failed: {error}")
            }))
        }
    }
}

fn blocking_error_response(error: actix_web::error::BlockingError) -> HttpResponse {
    tracing::error!(error = %error, "blocking session task failed");
    HttpResponse::InternalServerError().json(error_body("Internal", &error.to_string()))
}

fn error_body(kind: &str, message: &str) -> serde_json::Value {
    serde_json::json!({ "error": kind, "message": message })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use actix_web::{App, body::to_bytes, http::StatusCode, test, web};

    use crate::adapters::telemetry::TelemetrySample;
    use crate::adapters::telemetry_memory::{InMemoryTelemetryChannel, RelayOutcome};
    use crate::adapters::db::LATEST_SCHEMA_VERSION;
    use crate::app::controller::{ControllerSettings, SessionController};
    use crate::domain::session_state::{SystemClock, TimestampMs};
    use crate::test_support::open_test_store;

    use super::{ApiState, configure_routes};

    fn build_state(name: &str) -> (ApiState, Arc<InMemoryTelemetryChannel>) {
        let store = open_test_store(name);
        let channel = Arc::new(InMemoryTelemetryChannel::new());
        let controller = SessionController::new(
            Arc::new(store.clone()),
            channel.clone(),
            Arc::new(SystemClock),
            ControllerSettings {
                rate_per_kwh: 20.0,
                actuator_timeout: Duration::from_millis(100),
                enforce_energy_cap: false,
            },
        );

        (
            ApiState {
                controller,
                diagnostics: store,
            },
            channel,
        )
    }

    async fn read_json(resp: actix_web::dev::ServiceResponse) -> serde_json::Value {
        let body = to_bytes(resp.into_body())
            .await
            .expect("body should be readable");
        serde_json::from_slice(&body).expect("body should be json")
    }

    fn start_body(transaction_id: &str) -> serde_json::Value {
        serde_json::json!({
            "transactionId": transaction_id,
            "deviceId": "wallbox-1",
            "budgetCurrency": 100.0,
            "energyCapKWh": 5.0
        })
    }

    #[actix_web::test]
    async fn health_endpoint_returns_ok() {
        let (state, _) = build_state("api-health");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn start_returns_active_session() {
        let (state, _) = build_state("api-start");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/sessions/start")
            .set_json(start_body("tx-1"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = read_json(resp).await;
        assert_eq!(json["sessionId"], "session-tx-1");
        assert_eq!(json["status"], "ACTIVE");
        assert_eq!(json["relayState"], "ON");
        assert_eq!(json["energyCapKWh"], 5.0);
        assert_eq!(json["cumulativeEnergyKWh"], 0.0);
        assert_eq!(json["stopReason"], serde_json::Value::Null);
    }

    #[actix_web::test]
    async fn start_accepts_legacy_field_names() {
        let (state, _) = build_state("api-start-legacy");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/sessions/start")
            .set_json(serde_json::json!({
                "transactionId": "tx-legacy",
                "deviceId": "wallbox-1",
                "amountPaid": 40,
                "energySelected": 2
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = read_json(resp).await;
        assert_eq!(json["budgetCurrency"], 40.0);
        assert_eq!(json["energyCapKWh"], 2.0);
    }

    #[actix_web::test]
    async fn duplicate_start_returns_400() {
        let (state, _) = build_state("api-duplicate");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        for expected in [StatusCode::OK, StatusCode::BAD_REQUEST] {
            let req = test::TestRequest::post()
                .uri("/api/sessions/start")
                .set_json(start_body("tx-1"))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), expected);
            if expected == StatusCode::BAD_REQUEST {
                assert_eq!(read_json(resp).await["error"], "DuplicateTransaction");
            }
        }
    }

    #[actix_web::test]
    async fn invalid_budget_returns_400() {
        let (state, _) = build_state("api-invalid");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/sessions/start")
            .set_json(serde_json::json!({
                "transactionId": "tx-1",
                "deviceId": "wallbox-1",
                "budgetCurrency": -5
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(resp).await["error"], "InvalidRequest");
    }

    #[actix_web::test]
    async fn actuator_timeout_returns_502() {
        let (state, channel) = build_state("api-actuator");
        channel.script_relay(RelayOutcome::Timeout);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/sessions/start")
            .set_json(start_body("tx-1"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(read_json(resp).await["error"], "ActuatorUnavailable");

        let req = test::TestRequest::get()
            .uri("/api/sessions?transactionId=tx-1")
            .to_request();
        let json = read_json(test::call_service(&app, req).await).await;
        assert_eq!(json["status"], "ABORTED");
        assert_eq!(json["relayState"], "OFF");
    }

    #[actix_web::test]
    async fn stop_is_idempotent() {
        let (state, channel) = build_state("api-stop");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/sessions/start")
            .set_json(start_body("tx-1"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
        channel.publish_sample(TelemetrySample {
            device_id: "wallbox-1".to_string(),
            voltage: 230.0,
            current: 16.0,
            timestamp: TimestampMs(1_700_000_000_000),
        });

        let mut bodies = Vec::new();
        for _ in 0..2 {
            let req = test::TestRequest::post()
                .uri("/api/sessions/stop")
                .set_json(serde_json::json!({ "sessionId": "session-tx-1" }))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::OK);
            bodies.push(read_json(resp).await);
        }

        assert_eq!(bodies[0], bodies[1]);
        assert_eq!(bodies[0]["status"], "COMPLETED");
        assert_eq!(bodies[0]["stopReason"], "USER_REQUESTED");
        assert_eq!(bodies[0]["lastCurrent"], 16.0);
        assert_eq!(bodies[0]["lastPowerW"], 3680.0);
    }

    #[actix_web::test]
    async fn stop_unknown_session_returns_404() {
        let (state, _) = build_state("api-stop-unknown");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/sessions/stop")
            .set_json(serde_json::json!({ "sessionId": "session-none" }))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn session_lookups_return_404_or_record() {
        let (state, _) = build_state("api-lookup");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/api/sessions?transactionId=tx-1")
            .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::NOT_FOUND
        );
        let req = test::TestRequest::get().uri("/api/sessions").to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::BAD_REQUEST
        );

        let req = test::TestRequest::post()
            .uri("/api/sessions/start")
            .set_json(start_body("tx-1"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = test::TestRequest::get()
            .uri("/api/sessions/session-tx-1")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(read_json(resp).await["transactionId"], "tx-1");
    }

    #[actix_web::test]
    async fn diagnostics_report_counts_and_log_events() {
        let (state, channel) = build_state("api-diagnostics");
        channel.script_relay(RelayOutcome::Timeout);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/sessions/start")
            .set_json(start_body("tx-1"))
            .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::BAD_GATEWAY
        );

        let req = test::TestRequest::get().uri("/diagnostics").to_request();
        let json = read_json(test::call_service(&app, req).await).await;
        assert_eq!(json["schemaVersion"], LATEST_SCHEMA_VERSION);
        assert_eq!(json["sessionsCount"], 1);
        assert_eq!(json["logEventsCount"], 1);
        assert_eq!(json["liveSessions"], 0);

        let req = test::TestRequest::get()
            .uri("/diagnostics/log-events?limit=5")
            .to_request();
        let json = read_json(test::call_service(&app, req).await).await;
        let items = json.as_array().expect("response should be array");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["code"], "ACTUATOR_UNAVAILABLE");
        assert_eq!(items[0]["sessionId"], "session-tx-1");
    }

    #[actix_web::test]
    async fn device_lookups_list_known_devices_and_404_unknown_ones() {
        let (state, _) = build_state("api-devices");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/devices").to_request();
        let json = read_json(test::call_service(&app, req).await).await;
        assert_eq!(json, serde_json::json!([]));

        let req = test::TestRequest::post()
            .uri("/api/sessions/start")
            .set_json(start_body("tx-1"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = test::TestRequest::get().uri("/api/devices").to_request();
        let json = read_json(test::call_service(&app, req).await).await;
        let items = json.as_array().expect("response should be array");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["deviceId"], "wallbox-1");
        assert_eq!(items[0]["sessionCount"], 1);
        assert_eq!(items[0]["latestStatus"], "ACTIVE");
        assert_eq!(items[0]["activeSessionId"], "session-tx-1");

        let req = test::TestRequest::get()
            .uri("/api/devices/wallbox-1")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(read_json(resp).await["latestSessionId"], "session-tx-1");

        let req = test::TestRequest::get()
            .uri("/api/devices/wallbox-9")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(read_json(resp).await["error"], "NotFound");
    }
}
