// ===============================
// src/transport.rs (candle stream wire adapter)
// ===============================
//
// tokio-tungstenite implementation of the market-data stream: bearer-token
// handshake, JSON request frames, JSON event frames. Undecodable frames are
// logged and skipped; a read error ends the connection and lets the
// multiplexer reconnect.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{error, warn};
use url::Url;

use crate::domain::{CandleUpdate, StreamCommand, StreamEvent};
use crate::stream::{StreamConn, StreamError, StreamTransport};

pub struct CandleTransport {
    url: String,
    token: String,
    interval: String,
}

impl CandleTransport {
    pub fn new(url: &str, token: &str, interval: &str) -> Self {
        Self {
            url: url.to_string(),
            token: token.to_string(),
            interval: interval.to_string(),
        }
    }
}

#[async_trait]
impl StreamTransport for CandleTransport {
    async fn connect(&self) -> Result<Box<dyn StreamConn>, StreamError> {
        let url = Url::parse(&self.url).map_err(|e| StreamError::Dial(e.to_string()))?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| StreamError::Dial(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| StreamError::Dial(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws, _resp) = connect_async(request)
            .await
            .map_err(|e| StreamError::Dial(e.to_string()))?;
        Ok(Box::new(CandleConn { ws, interval: self.interval.clone() }))
    }
}

struct CandleConn {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    interval: String,
}

#[async_trait]
impl StreamConn for CandleConn {
    async fn send(&mut self, cmd: &StreamCommand) -> Result<(), StreamError> {
        let frame = encode_request(cmd, &self.interval, &request_id());
        self.ws
            .send(Message::Text(frame))
            .await
            .map_err(|e| StreamError::Send(e.to_string()))
    }

    async fn next_event(&mut self) -> Option<StreamEvent> {
        while let Some(frame) = self.ws.next().await {
            match frame {
                Ok(m) if m.is_text() => {
                    let txt = match m.into_text() {
                        Ok(t) => t,
                        Err(e) => {
                            warn!(error = %e, "failed to read text frame");
                            continue;
                        }
                    };
                    match decode_event(&txt) {
                        Some(event) => return Some(event),
                        None => {
                            warn!(frame = %txt, "undecodable frame, skipping");
                            continue;
                        }
                    }
                }
                Ok(_) => {
                    // ignore non-text frames
                }
                Err(e) => {
                    error!(error = %e, "ws read error");
                    return None;
                }
            }
        }
        None
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    event: &'a str,
    figi: &'a str,
    interval: &'a str,
    request_id: &'a str,
}

#[derive(Deserialize)]
struct WireEnvelope {
    event: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Deserialize)]
struct WireCandle {
    figi: String,
    /// Close price of the candle.
    c: f64,
}

fn encode_request(cmd: &StreamCommand, interval: &str, request_id: &str) -> String {
    let (event, figi) = match cmd {
        StreamCommand::SubscribeCandle { figi } => ("candle:subscribe", figi.as_str()),
        StreamCommand::UnsubscribeCandle { figi } => ("candle:unsubscribe", figi.as_str()),
    };
    serde_json::to_string(&WireRequest { event, figi, interval, request_id })
        .unwrap_or_default()
}

/// Decodes one frame. `Some(Other)` for recognized-but-unused event kinds,
/// `None` for frames that do not parse at all.
fn decode_event(frame: &str) -> Option<StreamEvent> {
    let envelope: WireEnvelope = serde_json::from_str(frame).ok()?;
    if envelope.event == "candle" {
        match serde_json::from_value::<WireCandle>(envelope.payload) {
            Ok(candle) => Some(StreamEvent::Candle(CandleUpdate {
                figi: candle.figi,
                close: candle.c,
            })),
            Err(e) => {
                warn!(error = %e, "malformed candle payload");
                None
            }
        }
    } else {
        Some(StreamEvent::Other(envelope.event))
    }
}

fn request_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_subscribe_request() {
        let cmd = StreamCommand::SubscribeCandle { figi: "BBG000B9XRY4".into() };
        let frame = encode_request(&cmd, "5min", "abcdef123456");
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["event"], "candle:subscribe");
        assert_eq!(v["figi"], "BBG000B9XRY4");
        assert_eq!(v["interval"], "5min");
        assert_eq!(v["request_id"], "abcdef123456");
    }

    #[test]
    fn encodes_unsubscribe_request() {
        let cmd = StreamCommand::UnsubscribeCandle { figi: "BBG000B9XRY4".into() };
        let frame = encode_request(&cmd, "5min", "r");
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["event"], "candle:unsubscribe");
    }

    #[test]
    fn decodes_candle_event() {
        let frame = r#"{"event":"candle","time":"2021-03-01T12:00:00Z","payload":
            {"o":101.0,"c":102.5,"h":103.0,"l":100.0,"v":200,"time":"2021-03-01T12:00:00Z",
             "interval":"5min","figi":"BBG000B9XRY4"}}"#;
        match decode_event(frame) {
            Some(StreamEvent::Candle(c)) => {
                assert_eq!(c.figi, "BBG000B9XRY4");
                assert_eq!(c.close, 102.5);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_kind_maps_to_other() {
        let frame = r#"{"event":"orderbook","payload":{"figi":"X","depth":1}}"#;
        match decode_event(frame) {
            Some(StreamEvent::Other(kind)) => assert_eq!(kind, "orderbook"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn garbage_frame_decodes_to_none() {
        assert!(decode_event("not json").is_none());
        // A candle envelope with a broken payload is skipped too.
        assert!(decode_event(r#"{"event":"candle","payload":{"figi":42}}"#).is_none());
    }

    #[test]
    fn request_ids_are_twelve_alphanumeric_chars() {
        let id = request_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
