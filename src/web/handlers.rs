//! HTTP request handlers.

use super::AppState;
use crate::config::ProbeSettings;
use crate::db::DbError;
use crate::scheduler::{default_policies, EngineError, Scope};
use crate::stats::{QueryError, Sort};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

// ============================================================================
// Errors
// ============================================================================

fn db_error(e: DbError) -> Response {
    let status = match e {
        DbError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string()).into_response()
}

fn engine_error(e: EngineError) -> Response {
    match e {
        EngineError::InvalidArgument(_) | EngineError::Config(_) => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        EngineError::Store(e) => db_error(e),
        EngineError::Resolve(_) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn query_error(e: QueryError) -> Response {
    match e {
        QueryError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        QueryError::Store(e) => db_error(e),
    }
}

// ============================================================================
// API: Probe engine
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub scope: String,
    #[serde(default)]
    pub group_ids: Vec<i64>,
}

pub async fn handle_probe_start(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> impl IntoResponse {
    let scope: Scope = match req.scope.parse() {
        Ok(s) => s,
        Err(e) => return engine_error(e),
    };

    match state.engine.start(scope, req.group_ids).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => engine_error(e),
    }
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub was_running: bool,
}

pub async fn handle_probe_stop(State(state): State<AppState>) -> impl IntoResponse {
    Json(StopResponse {
        was_running: state.engine.stop().await,
    })
}

pub async fn handle_probe_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.status().await)
}

// ============================================================================
// API: Settings
// ============================================================================

pub async fn handle_get_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.settings())
}

pub async fn handle_put_settings(
    State(state): State<AppState>,
    Json(settings): Json<ProbeSettings>,
) -> impl IntoResponse {
    if let Err(e) = settings.validate() {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    if let Err(e) = state.store.save_settings(&settings) {
        return db_error(e);
    }
    match state.engine.update_settings(settings.clone()) {
        Ok(()) => Json(settings).into_response(),
        Err(e) => engine_error(e),
    }
}

// ============================================================================
// API: Statistics
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    /// Comma-separated endpoint ids
    #[serde(default)]
    pub endpoint_ids: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
}

impl StatsQuery {
    fn ids(&self) -> Result<Vec<i64>, QueryError> {
        parse_ids(self.endpoint_ids.as_deref().unwrap_or(""))
    }

    fn sort(&self) -> Result<Option<Sort>, QueryError> {
        self.sort
            .as_deref()
            .map(|field| Sort::parse(field, self.order.as_deref()))
            .transpose()
    }
}

/// Parse a comma-separated id list; blank entries are skipped.
pub fn parse_ids(raw: &str) -> Result<Vec<i64>, QueryError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|_| QueryError::InvalidArgument(format!("invalid endpoint id: {}", s)))
        })
        .collect()
}

fn parse_time(name: &str, value: Option<&str>) -> Result<DateTime<Utc>, QueryError> {
    let value = value.ok_or_else(|| QueryError::InvalidArgument(format!("{} is required", name)))?;
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QueryError::InvalidArgument(format!("{} is not RFC 3339: {}", name, e)))
}

pub async fn handle_live_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> impl IntoResponse {
    let result = query
        .ids()
        .and_then(|ids| Ok((ids, query.sort()?)))
        .and_then(|(ids, sort)| state.stats.live(&ids, sort));

    match result {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => query_error(e),
    }
}

pub async fn handle_range_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> impl IntoResponse {
    let result = (|| {
        let ids = query.ids()?;
        let start = parse_time("start", query.start.as_deref())?;
        let end = parse_time("end", query.end.as_deref())?;
        state.stats.range(&ids, start, end, query.sort()?)
    })();

    match result {
        Ok(report) => Json(report).into_response(),
        Err(e) => query_error(e),
    }
}

// ============================================================================
// API: Inventory
// ============================================================================

pub async fn handle_get_endpoints(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_endpoints() {
        Ok(endpoints) => Json(endpoints).into_response(),
        Err(e) => db_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateEndpointRequest {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub group_id: Option<i64>,
}

pub async fn handle_create_endpoint(
    State(state): State<AppState>,
    Json(req): Json<CreateEndpointRequest>,
) -> impl IntoResponse {
    if req.address.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "address is required").into_response();
    }

    match state.store.add_endpoint(&req.name, req.address.trim(), req.group_id) {
        Ok(endpoint) => (StatusCode::CREATED, Json(endpoint)).into_response(),
        Err(e) => db_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
}

pub async fn handle_create_group(
    State(state): State<AppState>,
    Json(req): Json<CreateGroupRequest>,
) -> impl IntoResponse {
    if req.name.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "name is required").into_response();
    }

    match state.store.add_group(req.name.trim()) {
        Ok(group) => (StatusCode::CREATED, Json(group)).into_response(),
        Err(e) => db_error(e),
    }
}

// ============================================================================
// API: Storage
// ============================================================================

pub async fn handle_retention() -> impl IntoResponse {
    Json(default_policies())
}

pub async fn handle_storage(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_storage_stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => db_error(e),
    }
}

// ============================================================================
// Live events
// ============================================================================

pub async fn handle_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.publisher.subscribe();
    let closed = state.publisher.closed();
    let (tx, out) = mpsc::channel::<Event>(64);

    // Forward until the client goes away or the publisher closes on shutdown
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = closed.cancelled() => break,
                _ = tx.closed() => break,
                msg = rx.recv() => match msg {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Event subscriber lagged, skipped {} events", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            match Event::default().json_data(&event) {
                Ok(sse) => {
                    if tx.send(sse).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("Failed to encode probe event: {}", e),
            }
        }
    });

    Sse::new(ReceiverStream::new(out).map(Ok::<Event, Infallible>)).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::db::Store;
    use crate::events::BroadcastPublisher;
    use crate::probe::IcmpTransport;
    use crate::scheduler::{ProbeEngine, StoreResolver};
    use crate::stats::{StatsAggregator, StatsService};
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn state() -> (NamedTempFile, AppState) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let publisher = BroadcastPublisher::new();
        let engine = Arc::new(ProbeEngine::new(
            Arc::new(StoreResolver::new(store.clone())),
            Arc::new(IcmpTransport::new()),
            StatsAggregator::new(store.clone()),
            Arc::new(publisher.clone()),
            ProbeSettings::default(),
            4,
        ));
        let state = AppState {
            config: ServerConfig::default(),
            stats: StatsService::new(store.clone()),
            store,
            engine,
            publisher,
        };
        (tmp, state)
    }

    fn stats_query(ids: &str, start: Option<&str>, end: Option<&str>, sort: Option<&str>) -> StatsQuery {
        StatsQuery {
            endpoint_ids: Some(ids.to_string()),
            start: start.map(String::from),
            end: end.map(String::from),
            sort: sort.map(String::from),
            order: None,
        }
    }

    #[test]
    fn test_parse_ids() {
        assert_eq!(parse_ids("1, 2,,3").unwrap(), vec![1, 2, 3]);
        assert!(parse_ids("").unwrap().is_empty());
        assert!(matches!(parse_ids("1,x"), Err(QueryError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_start_rejects_bad_scope() {
        let (_tmp, state) = state();

        let req = StartRequest { scope: "groups".into(), group_ids: vec![] };
        let resp = handle_probe_start(State(state.clone()), Json(req)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = StartRequest { scope: "everything".into(), group_ids: vec![] };
        let resp = handle_probe_start(State(state.clone()), Json(req)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        assert!(!state.engine.status().await.running);
    }

    #[tokio::test]
    async fn test_put_settings_validates_and_persists() {
        let (_tmp, state) = state();

        let bad = ProbeSettings { icmp_payload_bytes: 4, ..Default::default() };
        let resp = handle_put_settings(State(state.clone()), Json(bad)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.store.load_settings().unwrap(), None);

        let good = ProbeSettings { ping_interval_sec: 5, ..Default::default() };
        let resp = handle_put_settings(State(state.clone()), Json(good.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.store.load_settings().unwrap(), Some(good.clone()));
        assert_eq!(state.engine.settings(), good);
    }

    #[tokio::test]
    async fn test_range_stats_argument_errors() {
        let (_tmp, state) = state();

        let missing_end = stats_query("1", Some("2024-01-01T00:00:00Z"), None, None);
        let resp = handle_range_stats(State(state.clone()), Query(missing_end)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let streak_sort = stats_query(
            "1",
            Some("2024-01-01T00:00:00Z"),
            Some("2024-01-01T01:00:00Z"),
            Some("max_consecutive_failed_count"),
        );
        let resp = handle_range_stats(State(state.clone()), Query(streak_sort)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let ok = stats_query("1", Some("2024-01-01T00:00:00Z"), Some("2024-01-01T01:00:00Z"), None);
        let resp = handle_range_stats(State(state.clone()), Query(ok)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_endpoint_in_unknown_group() {
        let (_tmp, state) = state();
        let req = CreateEndpointRequest {
            name: "gw".into(),
            address: "10.0.0.1".into(),
            group_id: Some(99),
        };
        let resp = handle_create_endpoint(State(state.clone()), Json(req)).await.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = CreateEndpointRequest {
            name: "gw".into(),
            address: "10.0.0.1".into(),
            group_id: None,
        };
        let resp = handle_create_endpoint(State(state), Json(req)).await.into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }
}
