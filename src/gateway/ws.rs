//! WebSocket transport for the gateway.
//!
//! Frames are JSON objects tagged by `type`. Inbound: `authenticate`, `call`,
//! `ping`. Outbound: `ready`, `result`, `error`, `pong`, `closing`.
//!
//! Each connection runs three tasks: the reader (this handler), a writer that
//! owns the socket sink, and a worker that executes calls one at a time in
//! arrival order. Closing the connection flips a watch flag; the worker then
//! skips anything still queued and drops the result of the call in flight.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::{BoundSession, ConnectionState, Gateway, ToolCall, ToolOutput};
use crate::api::{bearer_token, ApiError};
use crate::binding::DeviceId;
use crate::error::{AuthError, GatewayError, Result};
use crate::identity::api_keys::API_KEY_PREFIX;
use crate::identity::Credential;
use crate::scope::ScopeRequest;

/// Credentials and scope hints, from the query string or an `authenticate` frame.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ConnectParams {
    pub api_key: Option<String>,
    pub session: Option<String>,
    /// MAC address or endpoint URL. Authenticates on its own when no key or
    /// session is given; otherwise selects the device's application.
    pub device: Option<String>,
    pub app_id: Option<String>,
    #[serde(alias = "app")]
    pub app_name: Option<String>,
}

impl ConnectParams {
    fn has_credential(&self) -> bool {
        self.api_key.is_some() || self.session.is_some() || self.device.is_some()
    }

    /// Pick the credential: bearer header, then `api_key`, then `session`, then `device`.
    fn into_handshake(self, bearer: Option<String>) -> Result<(Option<Credential>, ScopeRequest)> {
        let device = self.device.as_deref().map(DeviceId::parse).transpose()?;
        let credential = if let Some(token) = bearer {
            Some(if token.starts_with(API_KEY_PREFIX) {
                Credential::ApiKey(token)
            } else {
                Credential::Session(token)
            })
        } else if let Some(key) = self.api_key {
            Some(Credential::ApiKey(key))
        } else if let Some(session) = self.session {
            Some(Credential::Session(session))
        } else {
            device.clone().map(Credential::Device)
        };

        let scope = ScopeRequest {
            app_id: self.app_id,
            device,
            app_name: self.app_name,
        };
        Ok((credential, scope))
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Authenticate(ConnectParams),
    Call {
        #[serde(default)]
        id: Option<serde_json::Value>,
        tool: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },
    Ping {
        #[serde(default)]
        nonce: Option<serde_json::Value>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Ready {
        user_id: String,
        app_id: String,
        app_name: String,
    },
    Result {
        id: Option<serde_json::Value>,
        result: ToolOutput,
    },
    Error {
        id: Option<serde_json::Value>,
        code: &'static str,
        message: String,
        retryable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        resets_at: Option<DateTime<Utc>>,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        nonce: Option<serde_json::Value>,
    },
    Closing {
        code: &'static str,
        message: String,
    },
}

impl OutboundFrame {
    fn error(id: Option<serde_json::Value>, err: &GatewayError) -> Self {
        Self::Error {
            id,
            code: err.code(),
            message: err.user_message(),
            retryable: err.is_retryable(),
            resets_at: err.resets_at(),
        }
    }

    fn closing(err: &GatewayError) -> Self {
        Self::Closing {
            code: err.code(),
            message: err.user_message(),
        }
    }
}

enum Outbound {
    Frame(OutboundFrame),
    Close,
}

struct PendingCall {
    id: Option<serde_json::Value>,
    call: Result<ToolCall>,
}

/// `GET /gateway/ws`. A malformed `device` parameter is rejected before the upgrade.
pub async fn gateway_ws(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> std::result::Result<Response, ApiError> {
    let bearer = bearer_token(&headers);
    let preset = if bearer.is_some() || params.has_credential() {
        Some(params.into_handshake(bearer)?)
    } else {
        None
    };
    Ok(ws.on_upgrade(move |socket| serve_connection(gateway, socket, preset)))
}

struct Connection {
    state: ConnectionState,
    out: mpsc::Sender<Outbound>,
}

impl Connection {
    fn advance(&mut self, next: ConnectionState) {
        if self.state.can_advance_to(next) {
            tracing::debug!(from = %self.state, to = %next, "connection state");
            self.state = next;
        } else {
            tracing::warn!(from = %self.state, to = %next, "ignored illegal connection transition");
        }
    }

    async fn send(&self, frame: OutboundFrame) -> bool {
        self.out.send(Outbound::Frame(frame)).await.is_ok()
    }

    /// Send a `closing` frame, then a close.
    async fn close_with(&mut self, err: &GatewayError) {
        let _ = self.send(OutboundFrame::closing(err)).await;
        let _ = self.out.send(Outbound::Close).await;
        self.advance(ConnectionState::Closed);
    }
}

async fn serve_connection(
    gateway: Gateway,
    socket: WebSocket,
    preset: Option<(Option<Credential>, ScopeRequest)>,
) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(64);

    let writer = tokio::spawn(async move {
        while let Some(outbound) = out_rx.recv().await {
            match outbound {
                Outbound::Frame(frame) => {
                    let payload = match serde_json::to_string(&frame) {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to encode frame");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let mut conn = Connection {
        state: ConnectionState::Connecting,
        out: out_tx,
    };
    let idle = gateway.config().server.idle_timeout();

    conn.advance(ConnectionState::Authenticating);
    let handshake = match preset {
        Some((Some(credential), scope)) => Ok((credential, scope)),
        Some((None, _)) | None => read_authenticate_frame(&mut stream, idle).await,
    };

    let session = match handshake {
        Ok((credential, scope)) => gateway.open_session(credential, scope, "ws").await,
        Err(e) => Err(e),
    };
    let session = match session {
        Ok(session) => session,
        Err(e) => {
            tracing::info!(code = e.code(), error = %e, "connection rejected");
            conn.close_with(&e).await;
            drop(conn);
            let _ = writer.await;
            return;
        }
    };

    conn.advance(ConnectionState::Bound);
    conn.send(OutboundFrame::Ready {
        user_id: session.account.user_id.clone(),
        app_id: session.application.id.clone(),
        app_name: session.application.name.clone(),
    })
    .await;

    let max_pending = gateway.config().server.max_pending_calls.max(1);
    let (call_tx, call_rx) = mpsc::channel::<PendingCall>(max_pending);
    let (closed_tx, closed_rx) = watch::channel(false);
    let worker = tokio::spawn(run_worker(
        gateway.clone(),
        Arc::clone(&session),
        call_rx,
        conn.out.clone(),
        closed_rx,
    ));

    conn.advance(ConnectionState::Serving);
    loop {
        let next = match tokio::time::timeout(idle, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                tracing::info!(app = %session.application.id, "idle timeout");
                let _ = conn
                    .send(OutboundFrame::Closing {
                        code: "idle_timeout",
                        message: format!("no frames for {}s", idle.as_secs()),
                    })
                    .await;
                break;
            }
        };

        let text = match next {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "socket read failed");
                break;
            }
            Some(Ok(_)) => continue,
        };

        match serde_json::from_str::<InboundFrame>(text.as_str()) {
            Ok(InboundFrame::Call { id, tool, arguments }) => {
                let call = ToolCall::parse(&tool, arguments);
                let pending = PendingCall { id: id.clone(), call };
                if call_tx.try_send(pending).is_err() {
                    let err = GatewayError::Validation(format!(
                        "too many pending calls (max {max_pending})"
                    ));
                    conn.send(OutboundFrame::error(id, &err)).await;
                }
            }
            Ok(InboundFrame::Ping { nonce }) => {
                conn.send(OutboundFrame::Pong { nonce }).await;
            }
            Ok(InboundFrame::Authenticate(_)) => {
                let err = GatewayError::Validation("connection is already authenticated".into());
                conn.send(OutboundFrame::error(None, &err)).await;
            }
            Err(e) => {
                conn.send(OutboundFrame::error(None, &GatewayError::from(e))).await;
            }
        }
    }

    // Closed: skip queued calls, let the in-flight one finish and discard it.
    let _ = closed_tx.send(true);
    drop(call_tx);
    let _ = worker.await;
    let _ = conn.out.send(Outbound::Close).await;
    conn.advance(ConnectionState::Closed);
    tracing::info!(
        account = %session.account.id,
        app = %session.application.id,
        "connection closed"
    );
    drop(session);
    drop(conn);
    let _ = writer.await;
}

/// Wait for the first frame and require it to be `authenticate`.
async fn read_authenticate_frame(
    stream: &mut futures_util::stream::SplitStream<WebSocket>,
    idle: std::time::Duration,
) -> Result<(Credential, ScopeRequest)> {
    let unauthenticated = || GatewayError::Auth(AuthError::InvalidCredential);
    loop {
        let next = tokio::time::timeout(idle, stream.next())
            .await
            .map_err(|_| unauthenticated())?;
        let text = match next {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            _ => return Err(unauthenticated()),
        };
        return match serde_json::from_str::<InboundFrame>(text.as_str()) {
            Ok(InboundFrame::Authenticate(params)) => match params.into_handshake(None)? {
                (Some(credential), scope) => Ok((credential, scope)),
                (None, _) => Err(unauthenticated()),
            },
            _ => {
                tracing::info!("first frame was not authenticate");
                Err(unauthenticated())
            }
        };
    }
}

async fn run_worker(
    gateway: Gateway,
    session: Arc<BoundSession>,
    mut calls: mpsc::Receiver<PendingCall>,
    out: mpsc::Sender<Outbound>,
    closed: watch::Receiver<bool>,
) {
    while let Some(pending) = calls.recv().await {
        if *closed.borrow() {
            tracing::debug!("skipping queued call on closed connection");
            continue;
        }

        let outcome = match pending.call {
            Ok(call) => gateway.call(&session, call).await,
            Err(e) => Err(e),
        };

        if *closed.borrow() {
            tracing::debug!("discarding result for closed connection");
            continue;
        }

        let frame = match outcome {
            Ok(result) => OutboundFrame::Result {
                id: pending.id,
                result,
            },
            Err(e) => {
                if e.is_retryable() {
                    tracing::warn!(code = e.code(), error = %e, "tool call failed");
                }
                OutboundFrame::error(pending.id, &e)
            }
        };
        if out.send(Outbound::Frame(frame)).await.is_err() {
            break;
        }
    }
}
