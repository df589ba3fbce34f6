//! WebSocket transport: bridges a socket and a controller link

use axum::{
    extract::{
        Request, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::StreamExt};
use tracing::{debug, error, warn};

use super::protocol::Request as ClientRequest;
use super::server::AppState;

/// Host part of an `Origin` value (`scheme://host[:port]`), `None` when the
/// value cannot be a serialized origin.
fn origin_host(origin: &str) -> Option<&str> {
    if origin.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return None;
    }
    let rest = match origin.split_once("://") {
        Some((scheme, rest)) if !scheme.is_empty() => rest,
        Some(_) => return None,
        // Opaque origins such as "null" have no host.
        None => return Some(""),
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    Some(authority.rsplit_once('@').map_or(authority, |(_, host)| host))
}

/// Whether a browser on `origin` may open the socket.
///
/// Requests without an `Origin` header come from non-browser clients and are
/// accepted. Otherwise the origin must be `localhost` (any port) or name the
/// same host the request was sent to.
pub fn origin_allowed(origin: Option<&str>, host: Option<&str>) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    let Some(origin_host) = origin_host(origin) else {
        return false;
    };
    let name = origin_host.split(':').next().unwrap_or("");
    if name.eq_ignore_ascii_case("localhost") {
        return true;
    }
    !origin_host.is_empty() && host.is_some_and(|host| origin_host.eq_ignore_ascii_case(host))
}

/// Reject cross-site WebSocket handshakes before the upgrade.
pub async fn check_origin(request: Request, next: Next) -> Response {
    let headers = request.headers();
    let origin = headers.get(header::ORIGIN).map(|v| v.to_str().ok());
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());

    let allowed = match origin {
        None => true,
        Some(None) => false,
        Some(Some(origin)) => origin_allowed(Some(origin), host),
    };
    if allowed {
        return next.run(request).await;
    }

    warn!(origin = ?headers.get(header::ORIGIN), host, "rejected cross-origin websocket");
    (StatusCode::FORBIDDEN, "Origin not allowed").into_response()
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Run the two pumps for one client until either side goes away.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let link = match state.controller.connect().await {
        Ok(link) => link,
        Err(e) => {
            warn!(error = %e, "rejecting websocket, controller unavailable");
            return;
        }
    };
    let id = link.id();
    let close = link.close_token();
    let (inbound, mut outbound) = link.split();
    let (mut sender, mut receiver) = socket.split();

    // Controller -> client
    let mut send_task = tokio::spawn(async move {
        while let Some(response) = outbound.next().await {
            let text = match response.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!(connection = id, error = %e, "unable to encode response");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        outbound.close();
        let _ = sender.close().await;
    });

    // Client -> controller
    let mut recv_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = inbound.closed() => break,
                message = receiver.next() => message,
            };
            match message {
                Some(Ok(Message::Text(text))) => match ClientRequest::from_json(&text) {
                    Ok(request) => {
                        if !inbound.push(request).await {
                            break;
                        }
                    }
                    Err(e) => warn!(connection = id, error = %e, "unable to decode request"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                // Binary frames are not part of the protocol; pings are
                // answered by axum.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = id, error = %e, "websocket read failed");
                    break;
                }
            }
        }
        inbound.close();
    });

    // Wait for either task to finish
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }
    close.cancel();
}
