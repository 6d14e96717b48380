//! Runs a [`ConnectionSession`] against a live server.

use std::collections::VecDeque;
use std::future::pending;
use std::pin::Pin;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::backlog::BacklogFetcher;
use super::session::{ConnState, ConnectionSession, Effect, Event};
use crate::protocol::ClientMessage;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Timer = Option<Pin<Box<Sleep>>>;

/// Input from the embedding application.
#[derive(Debug)]
pub enum Control {
    Event(Event),
    Send(ClientMessage),
    Shutdown,
}

enum Wake {
    Frame(Option<String>),
    Retry,
    AttemptReset,
    Backlog(Event),
    Control(Option<Control>),
}

/// Drives `session` until it desyncs or is shut down, then hands it back.
pub async fn run(
    mut session: ConnectionSession,
    socket_url: String,
    backlog: BacklogFetcher,
    mut control: mpsc::UnboundedReceiver<Control>,
    status: watch::Sender<ConnState>,
) -> ConnectionSession {
    let (backlog_tx, mut backlog_rx) = mpsc::unbounded_channel::<Event>();
    let mut socket: Option<Socket> = None;
    let mut retry: Timer = None;
    let mut reset: Timer = None;
    let mut queue = VecDeque::from([Event::Start]);

    loop {
        while let Some(event) = queue.pop_front() {
            for effect in session.handle(event) {
                match effect {
                    Effect::OpenTransport => match connect_async(socket_url.as_str()).await {
                        Ok((ws, _)) => {
                            socket = Some(ws);
                            queue.push_back(Event::Opened);
                        }
                        Err(e) => {
                            debug!(url = %socket_url, error = %e, "connect failed");
                            queue.push_back(Event::Closed);
                        }
                    },
                    Effect::CloseTransport => {
                        if let Some(mut ws) = socket.take() {
                            let _ = ws.close(None).await;
                        }
                    }
                    Effect::Send(frame) => {
                        let sent = match socket.as_mut() {
                            Some(ws) => ws.send(Message::Text(frame)).await.is_ok(),
                            None => false,
                        };
                        if !sent {
                            socket = None;
                            queue.push_back(Event::Closed);
                        }
                    }
                    Effect::ScheduleRetry(wait) => retry = Some(Box::pin(sleep(wait))),
                    Effect::ScheduleAttemptReset(wait) => reset = Some(Box::pin(sleep(wait))),
                    Effect::CancelTimers => {
                        retry = None;
                        reset = None;
                    }
                    Effect::FetchBacklog { generation, thread, start, end } => {
                        let fetcher = backlog.clone();
                        let tx = backlog_tx.clone();
                        tokio::spawn(async move {
                            let result = fetcher.fetch(thread, start, end).await.map_err(|e| e.to_string());
                            let _ = tx.send(Event::BacklogDone { generation, result });
                        });
                    }
                    Effect::Status(state) => {
                        let _ = status.send(state);
                    }
                }
            }
        }

        if session.state() == ConnState::Desynced {
            return session;
        }

        let wake = tokio::select! {
            frame = next_frame(&mut socket) => Wake::Frame(frame),
            _ = fire(&mut retry) => Wake::Retry,
            _ = fire(&mut reset) => Wake::AttemptReset,
            Some(event) = backlog_rx.recv() => Wake::Backlog(event),
            ctl = control.recv() => Wake::Control(ctl),
        };

        match wake {
            Wake::Frame(Some(text)) => queue.push_back(Event::Frame(text)),
            Wake::Frame(None) => {
                socket = None;
                queue.push_back(Event::Closed);
            }
            Wake::Retry => {
                retry = None;
                queue.push_back(Event::RetryTimer);
            }
            Wake::AttemptReset => {
                reset = None;
                queue.push_back(Event::AttemptReset);
            }
            Wake::Backlog(event) => queue.push_back(event),
            Wake::Control(Some(Control::Event(event))) => queue.push_back(event),
            Wake::Control(Some(Control::Send(msg))) => match session.send(&msg) {
                Some(Effect::Send(frame)) => {
                    if let Some(ws) = socket.as_mut() {
                        if let Err(e) = ws.send(Message::Text(frame)).await {
                            warn!(error = %e, "send failed");
                            socket = None;
                            queue.push_back(Event::Closed);
                        }
                    }
                }
                _ => debug!(state = ?session.state(), "not connected; dropping outbound message"),
            },
            Wake::Control(Some(Control::Shutdown)) | Wake::Control(None) => {
                if let Some(mut ws) = socket.take() {
                    let _ = ws.close(None).await;
                }
                return session;
            }
        }
    }
}

/// Next text frame, or `None` once the socket is gone. Pends forever without a socket.
async fn next_frame(socket: &mut Option<Socket>) -> Option<String> {
    let Some(ws) = socket.as_mut() else { return pending().await };
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Some(text),
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Err(e)) => {
                debug!(error = %e, "socket read failed");
                return None;
            }
            Some(Ok(_)) => {}
        }
    }
}

async fn fire(timer: &mut Timer) {
    match timer.as_mut() {
        Some(t) => t.as_mut().await,
        None => pending().await,
    }
}
