// =============================================================================
// Gateway Bridge Client — WebSocket JSON framing to the broker bridge
// =============================================================================
//
// The broker wire protocol lives in an external gateway bridge process; this
// client exchanges line-oriented JSON frames with it over a WebSocket.
// Inbound frames become `FeedEvent`s stamped with local receipt time at the
// earliest possible point (message receipt, before parsing the payload).
//
// The read loop returns when the stream ends so the caller (main) can apply
// reconnect backoff and re-issue subscriptions from scratch.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::feed::{BrokerRequests, FeedEvent};
use crate::types::now_ms;

/// Outbound half of the bridge connection. Requests are serialized into
/// frames and queued; the writer task owns the socket sink.
pub struct BridgeClient {
    outbound: mpsc::UnboundedSender<String>,
}

impl BridgeClient {
    fn send_frame(&self, frame: serde_json::Value) -> Result<()> {
        self.outbound
            .send(frame.to_string())
            .context("bridge writer task is gone")
    }
}

#[async_trait]
impl BrokerRequests for BridgeClient {
    async fn subscribe_l1(&self, req_id: i64, symbol: &str, exchange: &str) -> Result<()> {
        self.send_frame(json!({
            "type": "subscribe_l1",
            "req_id": req_id,
            "symbol": symbol,
            "exchange": exchange,
        }))
    }

    async fn cancel_l1(&self, req_id: i64) -> Result<()> {
        self.send_frame(json!({ "type": "cancel_l1", "req_id": req_id }))
    }

    async fn subscribe_depth(
        &self,
        req_id: i64,
        symbol: &str,
        rows: usize,
        exchange: &str,
    ) -> Result<()> {
        self.send_frame(json!({
            "type": "subscribe_depth",
            "req_id": req_id,
            "symbol": symbol,
            "rows": rows,
            "exchange": exchange,
        }))
    }

    async fn cancel_depth(&self, req_id: i64) -> Result<()> {
        self.send_frame(json!({ "type": "cancel_depth", "req_id": req_id }))
    }

    async fn subscribe_tbt(
        &self,
        req_id: i64,
        symbol: &str,
        tick_type: &str,
        exchange: &str,
    ) -> Result<()> {
        self.send_frame(json!({
            "type": "subscribe_tbt",
            "req_id": req_id,
            "symbol": symbol,
            "tick_type": tick_type,
            "exchange": exchange,
        }))
    }

    async fn cancel_tbt(&self, req_id: i64) -> Result<()> {
        self.send_frame(json!({ "type": "cancel_tbt", "req_id": req_id }))
    }
}

/// Connect to the bridge and run the socket until it drops.
///
/// Returns the outbound client immediately; inbound events flow into
/// `events` until the stream ends, at which point a `ConnectionClosed`
/// event is delivered and the spawned tasks finish.
pub async fn connect(
    addr: &str,
    events: mpsc::UnboundedSender<FeedEvent>,
) -> Result<BridgeClient> {
    info!(addr = %addr, "connecting to gateway bridge");
    let (ws_stream, _response) = connect_async(addr)
        .await
        .context("failed to connect to gateway bridge")?;
    info!(addr = %addr, "gateway bridge connected");

    let (mut write, mut read) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    // Writer: drain outbound frames into the socket.
    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = write.send(Message::Text(frame)).await {
                error!(error = %e, "bridge write failed, writer stopping");
                return;
            }
        }
    });

    // Reader: parse frames into events until the stream ends.
    tokio::spawn(async move {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let recv_ts = now_ms();
                    match parse_frame(&text, recv_ts) {
                        Ok(Some(event)) => {
                            if events.send(event).is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "unparseable bridge frame dropped");
                        }
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    warn!("gateway bridge stream ended");
                    let _ = events.send(FeedEvent::ConnectionClosed);
                    return;
                }
                Some(Ok(_)) => {
                    debug!("non-text bridge frame ignored");
                }
                Some(Err(e)) => {
                    error!(error = %e, "gateway bridge read error");
                    let _ = events.send(FeedEvent::ConnectionClosed);
                    return;
                }
            }
        }
    });

    Ok(BridgeClient {
        outbound: outbound_tx,
    })
}

/// Decode one inbound frame. Unknown frame types are skipped with a debug
/// log (the bridge may be newer than this binary).
fn parse_frame(text: &str, recv_ts_ms: i64) -> Result<Option<FeedEvent>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse bridge frame JSON")?;

    let frame_type = root["type"].as_str().context("missing field type")?;

    match frame_type {
        "depth" => {
            let req_id = root["req_id"].as_i64().context("missing field req_id")?;
            let position = root["position"]
                .as_u64()
                .context("missing field position")? as usize;
            let op_raw = root["op"].as_i64().context("missing field op")? as i32;
            let side_raw = root["side"].as_i64().context("missing field side")? as i32;
            let price = root["price"].as_f64().context("missing field price")?;
            let size = root["size"].as_f64().context("missing field size")?;
            Ok(Some(FeedEvent::Depth {
                req_id,
                position,
                op_raw,
                side_raw,
                price,
                size,
                recv_ts_ms,
            }))
        }
        "trade" => {
            let req_id = root["req_id"].as_i64().context("missing field req_id")?;
            let event_ts_raw = root["ts"].as_i64().context("missing field ts")?;
            let price = root["price"].as_f64().context("missing field price")?;
            let size = root["size"].as_f64().context("missing field size")?;
            Ok(Some(FeedEvent::Trade {
                req_id,
                event_ts_raw,
                price,
                size,
                recv_ts_ms,
            }))
        }
        "error" => {
            let req_id = root["req_id"].as_i64().unwrap_or(-1);
            let code = root["code"].as_i64().context("missing field code")? as i32;
            let message = root["message"].as_str().unwrap_or("").to_string();
            Ok(Some(FeedEvent::Error {
                req_id,
                code,
                message,
            }))
        }
        "connection_closed" => Ok(Some(FeedEvent::ConnectionClosed)),
        other => {
            debug!(frame_type = other, "unknown bridge frame type skipped");
            Ok(None)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_depth_frame() {
        let text = r#"{"type":"depth","req_id":1002,"position":0,"op":0,"side":1,"price":10.25,"size":300}"#;
        let event = parse_frame(text, 999).unwrap().unwrap();
        match event {
            FeedEvent::Depth {
                req_id,
                position,
                op_raw,
                side_raw,
                price,
                size,
                recv_ts_ms,
            } => {
                assert_eq!(req_id, 1002);
                assert_eq!(position, 0);
                assert_eq!(op_raw, 0);
                assert_eq!(side_raw, 1);
                assert!((price - 10.25).abs() < 1e-9);
                assert!((size - 300.0).abs() < 1e-9);
                assert_eq!(recv_ts_ms, 999);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parses_trade_frame() {
        let text = r#"{"type":"trade","req_id":1003,"ts":1700000000,"price":10.25,"size":50}"#;
        let event = parse_frame(text, 999).unwrap().unwrap();
        match event {
            FeedEvent::Trade {
                req_id,
                event_ts_raw,
                ..
            } => {
                assert_eq!(req_id, 1003);
                assert_eq!(event_ts_raw, 1_700_000_000);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parses_error_frame() {
        let text = r#"{"type":"error","req_id":1002,"code":10092,"message":"no depth"}"#;
        let event = parse_frame(text, 999).unwrap().unwrap();
        match event {
            FeedEvent::Error {
                req_id,
                code,
                message,
            } => {
                assert_eq!(req_id, 1002);
                assert_eq!(code, 10092);
                assert_eq!(message, "no depth");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_frame_type_is_skipped() {
        let text = r#"{"type":"account_summary","cash":12.5}"#;
        assert!(parse_frame(text, 999).unwrap().is_none());
    }

    #[test]
    fn garbage_frame_is_an_error() {
        assert!(parse_frame("not json", 999).is_err());
    }

    #[tokio::test]
    async fn outbound_requests_become_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = BridgeClient { outbound: tx };

        client.subscribe_l1(1001, "AAPL", "NASDAQ").await.unwrap();
        client.subscribe_depth(1002, "AAPL", 5, "NASDAQ").await.unwrap();
        client.subscribe_tbt(1003, "AAPL", "Last", "SMART").await.unwrap();
        client.cancel_depth(1002).await.unwrap();

        let l1: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(l1["type"], "subscribe_l1");
        assert_eq!(l1["req_id"], 1001);
        assert_eq!(l1["exchange"], "NASDAQ");

        let depth: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(depth["type"], "subscribe_depth");
        assert_eq!(depth["rows"], 5);

        let tbt: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(tbt["tick_type"], "Last");

        let cancel: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(cancel["type"], "cancel_depth");
        assert_eq!(cancel["req_id"], 1002);
    }
}
