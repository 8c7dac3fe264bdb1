//! JSON API over the engine.
//!
//! Authentication happens upstream; the caller's user id arrives in the
//! `x-user-id` header.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::extract::{FromRequestParts, MatchedPath, Path, Request, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{NaiveDate, NaiveTime, Weekday};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tracing::error;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;

pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub hub: Arc<NotifyHub>,
}

pub fn router(engine: Arc<Engine>, hub: Arc<NotifyHub>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/bookings", post(create_booking))
        .route("/bookings/:id", get(get_booking))
        .route("/bookings/:id/status", put(update_status))
        .route("/customers/me/bookings", get(my_bookings))
        .route("/providers/:id/bookings", get(provider_bookings))
        .route("/providers/:id/slots/:date", get(day_slots))
        .route("/providers/:id/availability", get(list_rules).put(upsert_rule))
        .route("/notifications/stream", get(notification_stream))
        .route_layer(middleware::from_fn(track_metrics))
        .with_state(AppState { engine, hub })
}

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    Unauthorized(&'static str),
    Unprocessable(&'static str),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

pub fn status_for(e: &EngineError) -> StatusCode {
    match e {
        EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::Unavailable { .. }
        | EngineError::OutsideAvailability { .. }
        | EngineError::InvalidWindow(_)
        | EngineError::LimitExceeded(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::SlotTaken(_) | EngineError::Conflict { .. } => StatusCode::CONFLICT,
        EngineError::Forbidden(_) | EngineError::CannotCancelConfirmed(_) => StatusCode::FORBIDDEN,
        EngineError::WalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Engine(e) => {
                let status = status_for(&e);
                if status.is_server_error() {
                    error!("request failed: {e}");
                }
                (status, e.code(), e.to_string())
            }
            ApiError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.to_string())
            }
            ApiError::Unprocessable(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_REQUEST", msg.to_string())
            }
        };
        let body = ErrorBody {
            error: code.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

// ── Caller identity ──────────────────────────────────────────────

/// The authenticated caller.
#[derive(Debug, Clone, Copy)]
pub struct Actor(pub UserId);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_HEADER)
            .ok_or(ApiError::Unauthorized("missing x-user-id header"))?;
        let id = raw
            .to_str()
            .ok()
            .and_then(|s| Ulid::from_string(s.trim()).ok())
            .ok_or(ApiError::Unauthorized("malformed x-user-id header"))?;
        Ok(Actor(id))
    }
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".into());
    let method = req.method().to_string();

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    metrics::counter!(
        observability::HTTP_REQUESTS_TOTAL,
        "method" => method.clone(),
        "route" => route.clone(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        observability::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method,
        "route" => route
    )
    .record(started.elapsed().as_secs_f64());
    response
}

// ── Bodies ───────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateBookingBody {
    pub provider_id: ProviderId,
    pub service_item_id: ServiceItemId,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub customer_address: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusBody {
    pub status: BookingStatus,
    pub role: Role,
    /// Status the caller last saw; omitted means "whatever it is now".
    #[serde(default)]
    pub expected_status: Option<BookingStatus>,
}

/// Weekly rule as clients see it: `day_of_week` 0 = Sunday .. 6 = Saturday.
#[derive(Debug, Serialize, Deserialize)]
pub struct RuleBody {
    pub day_of_week: u8,
    #[serde(default)]
    pub start_time: Option<NaiveTime>,
    #[serde(default)]
    pub end_time: Option<NaiveTime>,
    #[serde(default)]
    pub is_day_off: bool,
}

impl From<&AvailabilityRule> for RuleBody {
    fn from(rule: &AvailabilityRule) -> Self {
        Self {
            day_of_week: rule.day_of_week.num_days_from_sunday() as u8,
            start_time: Some(rule.window.start()),
            end_time: Some(rule.window.end()),
            is_day_off: rule.is_day_off,
        }
    }
}

fn weekday_from_sunday(n: u8) -> Option<Weekday> {
    (n <= 6).then(|| (0..n).fold(Weekday::Sun, |day, _| day.succ()))
}

// ── Handlers ─────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_booking(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Json(body): Json<CreateBookingBody>,
) -> Result<(StatusCode, Json<Booking>), ApiError> {
    let window = TimeWindow::new(body.start_time, body.end_time).map_err(EngineError::from)?;
    let booking = state
        .engine
        .create_booking(BookingRequest {
            customer_id: actor,
            provider_id: body.provider_id,
            service_item_id: body.service_item_id,
            date: body.date,
            window,
            notes: body.notes,
            customer_address: body.customer_address,
            customer_phone: body.customer_phone,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

async fn get_booking(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<BookingId>,
) -> Result<Json<Booking>, ApiError> {
    Ok(Json(state.engine.booking_for(id, actor).await?))
}

async fn update_status(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(id): Path<BookingId>,
    Json(body): Json<StatusBody>,
) -> Result<Json<Booking>, ApiError> {
    let engine = &state.engine;
    let updated = match body.expected_status {
        Some(expected) => {
            engine
                .transition_from(id, actor, body.role, expected, body.status)
                .await?
        }
        None => engine.transition(id, actor, body.role, body.status).await?,
    };
    Ok(Json(updated))
}

async fn my_bookings(State(state): State<AppState>, Actor(actor): Actor) -> Json<Vec<Booking>> {
    Json(state.engine.bookings_for_customer(actor).await)
}

async fn provider_bookings(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(provider_id): Path<ProviderId>,
) -> Result<Json<Vec<Booking>>, ApiError> {
    state.engine.authorize_provider(provider_id, actor).await?;
    Ok(Json(state.engine.bookings_for_provider(provider_id).await))
}

async fn day_slots(
    State(state): State<AppState>,
    Path((provider_id, date)): Path<(ProviderId, NaiveDate)>,
) -> Json<DayView> {
    Json(state.engine.day_view(provider_id, date).await)
}

async fn list_rules(
    State(state): State<AppState>,
    Path(provider_id): Path<ProviderId>,
) -> Json<Vec<RuleBody>> {
    let rules = state.engine.rules_for_provider(provider_id);
    Json(rules.iter().map(RuleBody::from).collect())
}

async fn upsert_rule(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(provider_id): Path<ProviderId>,
    Json(body): Json<RuleBody>,
) -> Result<StatusCode, ApiError> {
    let day = weekday_from_sunday(body.day_of_week)
        .ok_or(ApiError::Unprocessable("day_of_week must be 0 (Sunday) to 6 (Saturday)"))?;
    let rule = match (body.is_day_off, body.start_time, body.end_time) {
        (true, _, _) => AvailabilityRule::day_off(provider_id, day),
        (false, Some(start), Some(end)) => {
            let window = TimeWindow::new(start, end).map_err(EngineError::from)?;
            AvailabilityRule::open(provider_id, day, window)
        }
        (false, _, _) => {
            return Err(ApiError::Unprocessable("start_time and end_time are required"));
        }
    };
    state.engine.upsert_rule(actor, rule).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// The caller's in-app notifications as server-sent events, one
/// `notification` event per message. The subscription ends with the connection.
async fn notification_stream(
    State(state): State<AppState>,
    Actor(actor): Actor,
) -> Sse<impl Stream<Item = Result<SseEvent, axum::Error>>> {
    let subscription = state.hub.listen(actor);
    let events = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let frame = SseEvent::default()
            .event("notification")
            .json_data(&event);
        Some((frame, subscription))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::Request as HttpRequest;
    use futures::StreamExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use crate::catalog::{InMemoryCatalog, Provider, ServiceItem};
    use crate::notify::NotificationQueue;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bookd_test_http");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    struct Harness {
        app: Router,
        hub: Arc<NotifyHub>,
        provider_id: ProviderId,
        provider_user: UserId,
        item_id: ServiceItemId,
        customer: UserId,
    }

    fn harness(name: &str) -> Harness {
        let catalog = Arc::new(InMemoryCatalog::new());
        let provider_id = Ulid::new();
        let provider_user = Ulid::new();
        let item_id = Ulid::new();
        catalog.insert_provider(Provider {
            id: provider_id,
            user_id: provider_user,
            name: Some("Gita Appliance Repair".into()),
        });
        catalog.insert_service_item(ServiceItem {
            id: item_id,
            name: "Fridge service".into(),
            base_price: Money(220_000),
            is_active: true,
        });
        let (queue, _rx) = NotificationQueue::channel();
        let engine = Engine::new(test_wal_path(name), catalog, Arc::new(queue)).unwrap();
        let hub = Arc::new(NotifyHub::new());
        Harness {
            app: router(Arc::new(engine), hub.clone()),
            hub,
            provider_id,
            provider_user,
            item_id,
            customer: Ulid::new(),
        }
    }

    fn request(
        method: &str,
        uri: &str,
        user: Option<UserId>,
        body: Option<Value>,
    ) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user.to_string());
        }
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        builder.body(body).unwrap()
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        user: Option<UserId>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request(method, uri, user, body)).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn booking_body(h: &Harness, start: &str, end: &str) -> Value {
        json!({
            "provider_id": h.provider_id.to_string(),
            "service_item_id": h.item_id.to_string(),
            "date": "2026-03-02",
            "start_time": start,
            "end_time": end,
        })
    }

    async fn book(h: &Harness, actor: UserId, start: &str, end: &str) -> (StatusCode, Value) {
        let body = booking_body(h, start, end);
        call(&h.app, "POST", "/bookings", Some(actor), Some(body)).await
    }

    #[tokio::test]
    async fn health_is_open() {
        let h = harness("health.wal");
        let (status, body) = call(&h.app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn missing_identity_is_unauthorized() {
        let h = harness("unauthorized.wal");
        let body = booking_body(&h, "13:00:00", "14:00:00");
        let (status, err) = call(&h.app, "POST", "/bookings", None, Some(body)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(err["error"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn create_then_read_back() {
        let h = harness("create_read.wal");
        let (status, created) = book(&h, h.customer, "13:00:00", "14:00:00").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "pending");
        assert_eq!(created["total_price"], 220_000);

        let uri = format!("/bookings/{}", created["id"].as_str().unwrap());
        let (status, fetched) = call(&h.app, "GET", &uri, Some(h.provider_user), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["id"], created["id"]);

        let (status, err) = call(&h.app, "GET", &uri, Some(Ulid::new()), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(err["error"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn engine_errors_map_to_statuses() {
        let h = harness("error_mapping.wal");

        let (status, err) = book(&h, h.customer, "08:00:00", "09:00:00").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err["error"], "OUTSIDE_AVAILABILITY");
        assert!(err["message"].as_str().unwrap().contains("10:00-17:00"));

        let (status, err) = book(&h, h.customer, "14:00:00", "13:00:00").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err["error"], "INVALID_WINDOW");

        let (status, _) = book(&h, h.customer, "13:00:00", "14:00:00").await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, err) = book(&h, Ulid::new(), "13:30:00", "14:30:00").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["error"], "SLOT_TAKEN");

        let uri = format!("/bookings/{}", Ulid::new());
        let (status, err) = call(&h.app, "GET", &uri, Some(h.customer), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["error"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn status_flow_and_cancel_refusal() {
        let h = harness("status_flow.wal");
        let (_, created) = book(&h, h.customer, "11:00:00", "12:00:00").await;
        let uri = format!("/bookings/{}/status", created["id"].as_str().unwrap());

        let confirm = json!({
            "status": "confirmed",
            "role": "provider",
            "expected_status": "pending",
        });
        let (status, updated) =
            call(&h.app, "PUT", &uri, Some(h.provider_user), Some(confirm)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["status"], "confirmed");

        let cancel = json!({ "status": "cancelled", "role": "customer" });
        let (status, err) = call(&h.app, "PUT", &uri, Some(h.customer), Some(cancel)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(err["error"], "CANNOT_CANCEL_CONFIRMED");

        let stale = json!({
            "status": "rejected",
            "role": "provider",
            "expected_status": "pending",
        });
        let (status, err) = call(&h.app, "PUT", &uri, Some(h.provider_user), Some(stale)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["error"], "CONFLICT");
    }

    #[tokio::test]
    async fn availability_roundtrip_and_slots() {
        let h = harness("availability.wal");
        let uri = format!("/providers/{}/availability", h.provider_id);

        // Monday is 1 counting from Sunday.
        let rule = json!({ "day_of_week": 1, "start_time": "09:00:00", "end_time": "12:00:00" });
        let (status, _) = call(&h.app, "PUT", &uri, Some(h.customer), Some(rule.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&h.app, "PUT", &uri, Some(h.provider_user), Some(rule)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let bad_day = json!({ "day_of_week": 7, "is_day_off": true });
        let (status, err) = call(&h.app, "PUT", &uri, Some(h.provider_user), Some(bad_day)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err["error"], "INVALID_REQUEST");

        let (status, rules) = call(&h.app, "GET", &uri, None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rules[0]["day_of_week"], 1);
        assert_eq!(rules[0]["start_time"], "09:00:00");

        book(&h, h.customer, "10:00:00", "11:00:00").await;
        let slots = format!("/providers/{}/slots/2026-03-02", h.provider_id);
        let (status, view) = call(&h.app, "GET", &slots, None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["availability"]["source"], "configured");
        assert_eq!(view["free"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn provider_listing_requires_provider() {
        let h = harness("provider_listing.wal");
        book(&h, h.customer, "10:00:00", "11:00:00").await;
        let uri = format!("/providers/{}/bookings", h.provider_id);

        let (status, _) = call(&h.app, "GET", &uri, Some(h.customer), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, list) = call(&h.app, "GET", &uri, Some(h.provider_user), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (_, mine) = call(&h.app, "GET", "/customers/me/bookings", Some(h.customer), None).await;
        assert_eq!(mine.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn notification_stream_delivers_and_releases() {
        let h = harness("notification_stream.wal");

        let (status, _) = call(&h.app, "GET", "/notifications/stream", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let req = request("GET", "/notifications/stream", Some(h.provider_user), None);
        let response = h.app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.hub.channel_count(), 1);

        let event = NotificationEvent {
            target_user_id: h.provider_user,
            kind: NotificationKind::NewBookingRequest,
            title: "New Booking Request".into(),
            message: "You have a new booking request for Fridge service on 2026-03-02.".into(),
            related_booking_id: Ulid::new(),
        };
        assert!(h.hub.send(&event));

        let mut body = response.into_body().into_data_stream();
        let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
            .await
            .expect("no event within timeout")
            .unwrap()
            .unwrap();
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        assert!(text.contains("event: notification"), "{text}");
        assert!(text.contains(&event.related_booking_id.to_string()), "{text}");

        drop(body);
        assert_eq!(h.hub.channel_count(), 0);
    }

    #[test]
    fn sunday_based_weekdays() {
        assert_eq!(weekday_from_sunday(0), Some(Weekday::Sun));
        assert_eq!(weekday_from_sunday(1), Some(Weekday::Mon));
        assert_eq!(weekday_from_sunday(6), Some(Weekday::Sat));
        assert_eq!(weekday_from_sunday(7), None);
    }
}
