//! `GET /ws`: the telephony media stream.
//!
//! Each upgraded socket is split, wrapped in the relay's telephony seams,
//! and handed to [`run_call`]. Admission is decided before the upgrade so
//! that a full gateway answers 503 instead of accepting and hanging up.

use super::AppState;
use crate::relay::telephony::parse_telephony_event;
use crate::relay::{
    run_call, CallGuard, CallSettings, ConversationConnector, RelayError, RelayResult,
    TelephonyCommand, TelephonyEvent, TelephonySink, TelephonyStream,
};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;

/// GET /ws
pub async fn handle_media_stream(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let Some(guard) = state.registry.reserve() else {
        tracing::warn!(
            max_calls = state.registry.max_calls(),
            "Rejecting media stream: call limit reached"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many active calls").into_response();
    };
    tracing::debug!(
        call_id = %guard.call_id(),
        active_calls = state.registry.active_count(),
        "Reserved media stream slot"
    );

    let connector = Arc::clone(&state.connector);
    let settings = Arc::clone(&state.settings);
    ws.on_upgrade(move |socket| handle_media_stream_connection(socket, connector, settings, guard))
}

async fn handle_media_stream_connection(
    socket: WebSocket,
    connector: Arc<dyn ConversationConnector>,
    settings: Arc<CallSettings>,
    guard: CallGuard,
) {
    let call_id = guard.call_id().to_owned();
    tracing::info!(call_id = %call_id, "Media stream connected");

    let (ws_sender, ws_receiver) = socket.split();
    let link = WsTelephonyStream::new(ws_receiver);
    let sink = WsTelephonySink::new(ws_sender);

    match run_call(link, sink, connector.as_ref(), &settings, guard).await {
        Ok(report) => {
            tracing::debug!(call_id = %call_id, end = report.end.as_str(), "Media stream finished");
        }
        Err(e) => {
            tracing::warn!(call_id = %call_id, error = %e, "Call ended before relay was established");
        }
    }
}

// ── Telephony seams over an axum WebSocket ─────────────────────────

/// Reads Media Streams events from the receiving half of a socket.
pub struct WsTelephonyStream<S> {
    inner: S,
}

impl<S> WsTelephonyStream<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S, E> TelephonyStream for WsTelephonyStream<S>
where
    S: Stream<Item = Result<Message, E>> + Send + Unpin,
    E: Display + Send,
{
    async fn next_event(&mut self) -> Option<RelayResult<TelephonyEvent>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(parse_telephony_event(text.as_str())),
                Ok(Message::Close(_)) => return None,
                Ok(Message::Binary(_)) => {
                    return Some(Err(RelayError::InvalidPayload(
                        "binary frame on media stream".into(),
                    )));
                }
                // Ping/pong is answered by axum.
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Err(e) => return Some(Err(RelayError::TelephonyClosed(e.to_string()))),
            }
        }
    }
}

/// Writes commands to the sending half of a socket.
pub struct WsTelephonySink<S> {
    inner: S,
}

impl<S> WsTelephonySink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> TelephonySink for WsTelephonySink<S>
where
    S: Sink<Message> + Send + Unpin,
    S::Error: Display,
{
    async fn send(&mut self, command: TelephonyCommand) -> RelayResult<()> {
        let json = command.to_json()?;
        self.inner
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| RelayError::TelephonySend(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::gateway::build_router;
    use crate::relay::testing::ScriptedConnector;
    use crate::relay::ConversationEvent;
    use crate::relay::Intent;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn serve(state: AppState) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        addr
    }

    fn start_json(stream_sid: &str) -> String {
        serde_json::json!({
            "event": "start",
            "start": {"streamSid": stream_sid, "callSid": "CA1"},
            "streamSid": stream_sid,
        })
        .to_string()
    }

    #[tokio::test]
    async fn media_stream_relays_both_directions() {
        let (connector, events_tx) = ScriptedConnector::new();
        let connector = Arc::new(connector);
        let state = AppState::new(Config::default(), connector.clone());
        let registry = Arc::clone(&state.registry);
        let addr = serve(state).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();

        ws.send(WsMessage::Text(start_json("MZ1").into())).await.unwrap();
        events_tx
            .send(ConversationEvent::ResponseStarted {
                response_id: Some("resp_1".into()),
            })
            .await
            .unwrap();
        events_tx
            .send(ConversationEvent::AudioDelta {
                payload: "AAAA".into(),
                response_id: Some("resp_1".into()),
            })
            .await
            .unwrap();

        let reply = loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => break text,
                _ => continue,
            }
        };
        let reply: serde_json::Value = serde_json::from_str(reply.as_str()).unwrap();
        assert_eq!(reply["event"], "media");
        assert_eq!(reply["streamSid"], "MZ1");
        assert_eq!(reply["media"]["payload"], "AAAA");

        ws.send(WsMessage::Text(
            r#"{"event":"media","media":{"track":"inbound","payload":"//8="}}"#.into(),
        ))
        .await
        .unwrap();
        ws.send(WsMessage::Text(r#"{"event":"stop"}"#.into()))
            .await
            .unwrap();

        // Drain until the relay closes the socket.
        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, WsMessage::Close(_)) {
                break;
            }
        }

        let mut committed = false;
        for _ in 0..100 {
            if connector
                .conversation
                .control_intents()
                .contains(&Intent::Commit)
                && registry.active_count() == 0
            {
                committed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(committed);
        assert_eq!(connector.conversation.appended(), 1);
    }

    #[tokio::test]
    async fn full_gateway_rejects_upgrade_with_503() {
        let (connector, _events_tx) = ScriptedConnector::new();
        let mut config = Config::default();
        config.gateway.max_concurrent_calls = 1;
        let state = AppState::new(config, Arc::new(connector));
        let _occupied = state.registry.reserve().unwrap();
        let addr = serve(state).await;

        let err = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .err()
            .unwrap();
        match err {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), 503);
            }
            other => panic!("expected HTTP 503, got {other}"),
        }
    }
}
