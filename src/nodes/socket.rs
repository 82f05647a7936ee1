//! Control socket of a node.
//!
//! One task per node runs [`run`]: it opens the socket, forwards decoded
//! frames to the dispatcher and, when the socket drops, waits
//! `reconnect_timeout` and tries again until the retry budget is spent.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::message::IncomingMessage;
use super::{Node, NodeState};
use crate::error::{Error, Result};
use crate::events::ManagerEvent;

enum SessionOutcome {
    /// The socket went away, with the close code when there was one.
    Closed(Option<u16>),
    /// `disconnect()` or shutdown asked us to stop.
    Shutdown,
}

pub(super) async fn run(
    node: Arc<Node>,
    inbound: mpsc::Sender<IncomingMessage>,
    cancel: CancellationToken,
) {
    loop {
        node.set_state(NodeState::Connecting);

        let outcome = match session(&node, &inbound, &cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                node.report_error(e.to_string(), false);
                SessionOutcome::Closed(None)
            }
        };

        let code = match outcome {
            SessionOutcome::Shutdown => {
                debug!("Socket task of {} stopped", node.name());
                return;
            }
            SessionOutcome::Closed(code) => code,
        };

        // Not selectable again until the next handshake succeeds.
        node.set_state(NodeState::Connecting);
        node.emit(ManagerEvent::NodeDisconnect {
            node: node.name().to_string(),
            code,
        });

        let attempt = node.record_attempt();
        let tries = node.options().reconnect_tries;
        if attempt > tries {
            node.report_error(
                format!("gave up reconnecting after {} attempts", tries),
                true,
            );
            node.set_state(NodeState::Disconnected);
            node.fail_over().await;
            return;
        }

        let delay = node.options().reconnect_timeout;
        info!(
            "🔄 Reconectando nodo {} en {:?} (intento {}/{})",
            node.name(),
            delay,
            attempt,
            tries
        );
        node.emit(ManagerEvent::NodeReconnect {
            node: node.name().to_string(),
            attempt,
        });

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn session(
    node: &Arc<Node>,
    inbound: &mpsc::Sender<IncomingMessage>,
    cancel: &CancellationToken,
) -> Result<SessionOutcome> {
    let request = handshake_request(node)?;

    let (stream, _) = tokio::select! {
        _ = cancel.cancelled() => return Ok(SessionOutcome::Shutdown),
        connected = tokio_tungstenite::connect_async(request) => connected?,
    };
    node.on_open();

    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "destroy".into(),
                };
                if let Err(e) = write.send(Message::Close(Some(frame))).await {
                    debug!("Close frame to {} not delivered: {}", node.name(), e);
                }
                return Ok(SessionOutcome::Shutdown);
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match IncomingMessage::parse(text.as_str()) {
                    Ok(message) => {
                        if inbound.send(message).await.is_err() {
                            return Ok(SessionOutcome::Shutdown);
                        }
                    }
                    Err(e) => node.report_error(format!("unreadable frame: {}", e), false),
                },
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|frame| u16::from(frame.code));
                    warn!("Nodo {} cerró el socket ({:?})", node.name(), code);
                    return Ok(SessionOutcome::Closed(code));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    node.report_error(format!("socket error: {}", e), false);
                    return Ok(SessionOutcome::Closed(None));
                }
                None => return Ok(SessionOutcome::Closed(None)),
            }
        }
    }
}

fn handshake_request(node: &Node) -> Result<Request> {
    let options = node.options();
    let descriptor = node.descriptor();

    let mut request = descriptor.socket_url().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert("Authorization", header(&descriptor.password)?);
    headers.insert("User-Id", header(&options.user_id)?);
    headers.insert("Client-Name", header(&options.client_name)?);

    if options.resume {
        if let Some(session_id) = node.session_id() {
            headers.insert("Session-Id", header(&session_id)?);
        }
        if let Some(key) = &options.resume_key {
            headers.insert("Resume-Key", header(key)?);
        }
    }

    Ok(request)
}

fn header(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::Configuration(format!("invalid header value: {}", e)))
}
