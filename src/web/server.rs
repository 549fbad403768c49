use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};

use crate::engine::ExecutionOutcome;
use crate::types::{Direction, Signal, TakeProfit};

use super::state::AppState;

pub async fn start_server(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    // Keep the candle history warm for GET /candles.
    {
        let state = state.clone();
        let mut feed = state.candle_feed.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = feed.recv().await {
                state.record_candle(&event).await;
            }
        });
    }

    let app = Router::new()
        .route("/signal", post(post_signal))
        .route("/positions", get(get_positions))
        .route("/orders", get(get_orders))
        .route("/open-orders", get(get_open_orders))
        .route("/equity", get(get_equity))
        .route("/candles", get(get_candles))
        .route("/config", get(get_config))
        .route("/health", get(get_health))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", port);
    info!("http surface listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TakeProfitRequest {
    price: f64,
    #[serde(alias = "pctOfPosition", alias = "pct_of_position")]
    fraction_of_position: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignalRequest {
    direction: Direction,
    entry_price: Option<f64>,
    stop_loss: f64,
    #[serde(default)]
    take_profits: Vec<TakeProfitRequest>,
    #[serde(default)]
    comment: String,
    alert_id: Option<String>,
    coin: Option<String>,
}

async fn post_signal(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SignalRequest>,
) -> impl IntoResponse {
    let coin = match request.coin.or(state.default_coin().await) {
        Some(coin) => coin,
        None => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"status": "rejected", "reason": "no coin specified"})),
            )
        }
    };
    let Some(current_price) = state.prices.get(&coin).await else {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"status": "rejected", "reason": format!("no market price for {}", coin)})),
        );
    };

    let signal = Signal {
        direction: request.direction,
        entry_price: request.entry_price,
        stop_loss: request.stop_loss,
        take_profits: request
            .take_profits
            .iter()
            .map(|tp| TakeProfit {
                price: tp.price,
                pct_of_position: tp.fraction_of_position,
            })
            .collect(),
        comment: request.comment,
        alert_id: request.alert_id,
        source: "webhook".to_string(),
    };

    match state
        .executor
        .handle_signal(&coin, &signal, current_price, Utc::now().timestamp_millis())
        .await
    {
        Ok(ExecutionOutcome::Executed { alert_id }) => (
            StatusCode::OK,
            Json(json!({"status": "executed", "alert_id": alert_id})),
        ),
        Ok(ExecutionOutcome::Rejected { alert_id, reason }) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"status": "rejected", "alert_id": alert_id, "reason": reason})),
        ),
        Err(e) => {
            error!("signal handling error: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "reason": e.to_string()})),
            )
        }
    }
}

async fn get_positions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.book.get_all().await)
}

async fn get_orders(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.db.recent_orders(200).await {
        Ok(orders) => Json(orders).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn get_open_orders(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.db.pending_orders().await {
        Ok(orders) => Json(orders).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn get_equity(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.db.recent_equity(500).await {
        Ok(snapshots) => {
            let points: Vec<Value> = snapshots
                .iter()
                .map(|s| {
                    json!({
                        "timestamp": s.timestamp.to_rfc3339(),
                        "equity": s.equity,
                        "unrealized_pnl": s.unrealized_pnl,
                        "realized_pnl": s.realized_pnl,
                        "open_positions": s.open_positions,
                    })
                })
                .collect();
            Json(points).into_response()
        }
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct CandleQuery {
    coin: Option<String>,
    before: Option<i64>,
    limit: Option<usize>,
}

async fn get_candles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CandleQuery>,
) -> impl IntoResponse {
    let coin = match query.coin.or(state.default_coin().await) {
        Some(coin) => coin,
        None => return Json(Vec::<crate::types::Candle>::new()).into_response(),
    };
    let limit = query.limit.unwrap_or(200).min(1_000);
    Json(state.candles_before(&coin, query.before, limit).await).into_response()
}

async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config_summary.clone())
}

async fn get_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "mode": state.mode.as_str(),
        "uptime_secs": state.uptime_secs(),
        "open_positions": state.book.count().await,
    }))
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| ws_session(socket, state))
}

fn frame(frame_type: &str, data: Value) -> Message {
    Message::Text(
        json!({
            "type": frame_type,
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        })
        .to_string(),
    )
}

/// Pushes a snapshot on connect, then candles as they stream and a periodic
/// refresh of positions, orders, equity and prices.
async fn ws_session(mut socket: WebSocket, state: Arc<AppState>) {
    let snapshot = json!({
        "positions": state.book.get_all().await,
        "open_orders": state.db.pending_orders().await.unwrap_or_default(),
        "prices": state.prices.all().await,
        "signals": state
            .db
            .recent_signals(50)
            .await
            .map(|rows| {
                rows.iter()
                    .map(|r| {
                        json!({
                            "alert_id": r.alert_id,
                            "asset": r.asset,
                            "side": r.side,
                            "risk_check_passed": r.risk_check_passed,
                            "reason": r.risk_check_reason,
                            "created_at": r.created_at.to_rfc3339(),
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default(),
        "mode": state.mode.as_str(),
    });
    if socket.send(frame("snapshot", snapshot)).await.is_err() {
        return;
    }

    let mut candles = state.candle_feed.subscribe();
    let mut signals = state.executor.subscribe_signals();
    let mut refresh = tokio::time::interval(tokio::time::Duration::from_secs(5));

    loop {
        tokio::select! {
            update = signals.recv() => {
                match update {
                    Ok(update) => {
                        // one-row window; clients merge it into their list
                        if socket.send(frame("signals", json!([update]))).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => {
                        debug!("ws client lagged behind signal feed");
                        continue;
                    }
                }
            }
            event = candles.recv() => {
                match event {
                    Ok(event) => {
                        let message = frame("candle", json!({
                            "coin": event.coin,
                            "interval": event.interval.as_str(),
                            "candle": event.candle,
                            "is_closed": event.is_closed,
                        }));
                        if socket.send(message).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => {
                        debug!("ws client lagged behind candle feed");
                        continue;
                    }
                }
            }
            _ = refresh.tick() => {
                let positions = frame("positions", json!(state.book.get_all().await));
                let prices = frame("prices", json!(state.prices.all().await));
                let orders = frame("orders", json!(state.db.recent_orders(50).await.unwrap_or_default()));
                let open_orders = frame("open-orders", json!(state.db.pending_orders().await.unwrap_or_default()));
                let equity = frame("equity", json!(state
                    .db
                    .recent_equity(1)
                    .await
                    .ok()
                    .and_then(|mut v| v.pop())
                    .map(|s| json!({
                        "timestamp": s.timestamp.to_rfc3339(),
                        "equity": s.equity,
                        "unrealized_pnl": s.unrealized_pnl,
                        "realized_pnl": s.realized_pnl,
                        "open_positions": s.open_positions,
                    }))));
                for message in [positions, prices, orders, open_orders, equity] {
                    if socket.send(message).await.is_err() {
                        return;
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return,
                }
            }
        }
    }
}

fn internal_error(e: anyhow::Error) -> axum::response::Response {
    error!("http handler error: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"status": "error", "reason": e.to_string()})),
    )
        .into_response()
}
