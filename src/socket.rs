//! WebSocket transport for [`ClientSession`].

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::auth::decode_jwt;
use crate::models::Identity;
use crate::protocol::ServerMessage;
use crate::router::{ClientSession, Flow};
use crate::services::Services;

type Sink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Accepts connections until the listener fails.
pub async fn serve(listener: TcpListener, services: Arc<Services>) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "socket listener ready");
    loop {
        let (stream, addr) = listener.accept().await?;
        tokio::spawn(handle_connection(stream, addr, services.clone()));
    }
}

/// Staff token from `?token=` or an `Authorization: Bearer` header.
fn token_from(req: &Request) -> Option<String> {
    let from_query = req.uri().query().and_then(|q| {
        q.split('&')
            .filter_map(|kv| kv.split_once('='))
            .find(|(k, _)| *k == "token")
            .map(|(_, v)| v.to_string())
    });
    from_query.or_else(|| {
        req.headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
    })
}

pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, services: Arc<Services>) {
    let mut token = None;
    let ws = match accept_hdr_async(stream, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        token = token_from(req);
        Ok(resp)
    })
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%addr, error = %e, "websocket handshake failed");
            return;
        }
    };

    let ip = addr.ip().to_string();
    let identity = match token.as_deref().map(decode_jwt) {
        Some(Ok(claims)) => claims.identity(ip),
        Some(Err(e)) => {
            debug!(%addr, error = %e, "ignoring invalid staff token");
            Identity::anonymous(ip)
        }
        None => Identity::anonymous(ip),
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Arc<str>>();
    let mut session = ClientSession::new(services, identity, tx);
    debug!(session = session.id, %addr, tier = ?session.identity.tier, "session opened");
    let (mut sink, mut incoming) = ws.split();

    loop {
        tokio::select! {
            msg = incoming.next() => match msg {
                Some(Ok(Message::Text(text))) => match session.handle_frame(&text).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Close) => {
                        flush(&mut sink, &mut rx).await;
                        break;
                    }
                    Err(e) => {
                        warn!(session = session.id, %addr, error = %e, "protocol error");
                        flush(&mut sink, &mut rx).await;
                        if let Ok(frame) = ServerMessage::Invalid(e.to_string()).encode() {
                            let _ = sink.send(Message::Text(frame)).await;
                        }
                        break;
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(session = session.id, error = %e, "websocket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
            Some(frame) = rx.recv() => {
                if sink.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
        }
    }

    session.close().await;
    let _ = sink.close().await;
    debug!(session = session.id, %addr, "session closed");
}

async fn flush(sink: &mut Sink, rx: &mut mpsc::UnboundedReceiver<Arc<str>>) {
    while let Ok(frame) = rx.try_recv() {
        if sink.send(Message::Text(frame.to_string())).await.is_err() {
            return;
        }
    }
}
