//! WebSocket transport, server side.
//!
//! One task per connection.  Each connection gets a fresh [`SessionId`]; its
//! inbound batches are handled in order on the read loop, while a committed
//! generation runs on its own task so buffering continues meanwhile.  All
//! outbound frames go through a per-connection channel to a single writer
//! task; a generation result for a connection that has gone away is simply
//! dropped.  A connection whose session was swept is closed with
//! `CloseCode::Again`, so the client can reconnect and be admitted afresh.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};

use crate::coordinator::{Dispatch, Outcome};
use crate::engine::Engine;
use crate::generator::Generator;
use crate::session::SessionId;
use super::message::{decode_packet, encode_reply, Reply};

const OUTBOUND_QUEUE: usize = 32;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const LIVENESS_CHECK: Duration = Duration::from_secs(5);

/// Bind `addr` and serve until the listener fails.
pub async fn serve<G: Generator>(
    addr:    SocketAddr,
    ws_path: String,
    engine:  Arc<Engine<G>>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("WS: listening on {} (path {ws_path})", listener.local_addr()?);
    run(listener, ws_path, engine).await
}

/// Accept loop over an already-bound listener.
pub async fn run<G: Generator>(
    listener: TcpListener,
    ws_path:  String,
    engine:   Arc<Engine<G>>,
) -> anyhow::Result<()> {
    let ws_path = Arc::new(ws_path);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                // Typically fd exhaustion; back off instead of spinning.
                warn!("WS: accept failed: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let engine  = Arc::clone(&engine);
        let ws_path = Arc::clone(&ws_path);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, &ws_path, engine).await {
                warn!("WS {peer}: {e}");
            }
        });
    }
}

async fn handle_connection<G: Generator>(
    stream:  TcpStream,
    peer:    SocketAddr,
    ws_path: &str,
    engine:  Arc<Engine<G>>,
) -> anyhow::Result<()> {
    let expected = ws_path.to_string();
    let mut ws = accept_hdr_async(stream, move |req: &Request, resp: Response| {
        if req.uri().path() == expected {
            Ok(resp)
        } else {
            let mut err = ErrorResponse::new(Some(format!("no WebSocket endpoint at {}", req.uri().path())));
            *err.status_mut() = StatusCode::NOT_FOUND;
            Err(err)
        }
    })
    .await?;

    let id = SessionId::generate();
    info!("WS {peer}: connection established for session {id}");

    if let Err(e) = engine.on_connect(id.clone()) {
        let frame = CloseFrame { code: CloseCode::Again, reason: e.to_string().into() };
        ws.close(Some(frame)).await?;
        return Ok(());
    }

    let (mut sink, mut inbound) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

    let writer_id = id.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                debug!("session {writer_id}: send failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut liveness = tokio::time::interval(LIVENESS_CHECK);
    liveness.tick().await;

    let result: anyhow::Result<()> = async {
        loop {
            tokio::select! {
                frame = inbound.next() => {
                    let Some(frame) = frame else { break };
                    match frame? {
                        Message::Text(text)  => handle_text(&engine, &id, &text, &tx).await,
                        Message::Binary(_)   => send_outcome(&tx, &id, &Outcome::error("Invalid message format")).await,
                        Message::Ping(p)     => { let _ = tx.send(Message::Pong(p)).await; }
                        Message::Close(_)    => break,
                        _                    => {}
                    }
                }
                _ = liveness.tick() => {}
            }
            // An idle or pressure sweep may have reclaimed the session while
            // the socket stayed open.
            if !engine.registry().contains(id.as_str()) {
                info!("WS {peer}: session {id} was reclaimed; closing connection");
                let frame = CloseFrame { code: CloseCode::Again, reason: "session expired".into() };
                let _ = tx.send(Message::Close(Some(frame))).await;
                break;
            }
        }
        Ok(())
    }
    .await;

    engine.on_disconnect(id.as_str());
    match &result {
        Ok(())  => info!("WS {peer}: connection closed for session {id}"),
        Err(e)  => error!("WS {peer}: transport error for session {id}: {e}"),
    }
    result
}

async fn handle_text<G: Generator>(
    engine: &Arc<Engine<G>>,
    id:     &SessionId,
    text:   &str,
    tx:     &mpsc::Sender<Message>,
) {
    let packet = match decode_packet(text) {
        Ok(p) => p,
        Err(e) => {
            warn!("session {id}: undecodable message: {e}");
            send_outcome(tx, id, &Outcome::error("Invalid message format")).await;
            return;
        }
    };
    let samples = packet.signal_data.unwrap_or_default();
    debug!("session {id}: packet timestamp={:?} samples={}", packet.timestamp, samples.len());

    match engine.on_samples(id.as_str(), &samples) {
        Dispatch::Reply(outcome) => send_outcome(tx, id, &outcome).await,
        Dispatch::Generate(job) => {
            let engine = Arc::clone(engine);
            let tx = tx.clone();
            let id = id.clone();
            tokio::spawn(async move {
                if let Some(outcome) = engine.coordinator().generate(job).await {
                    send_outcome(&tx, &id, &outcome).await;
                }
            });
        }
    }
}

async fn send_outcome(tx: &mpsc::Sender<Message>, id: &SessionId, outcome: &Outcome) {
    let text = match encode_reply(&Reply::from(outcome)) {
        Ok(t) => t,
        Err(e) => { error!("session {id}: cannot encode reply: {e}"); return; }
    };
    if tx.send(Message::Text(text)).await.is_err() {
        debug!("session {id}: connection gone; reply dropped");
        return;
    }
    match outcome {
        Outcome::Success { .. }   => info!("session {id}: sent music response"),
        Outcome::Error { message } => warn!("session {id}: sent error response: {message}"),
        Outcome::Buffering { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_tungstenite::connect_async;

    use crate::generator::GenerateError;
    use crate::governor::{GovernorLimits, MemoryProbe, ResourceGovernor};
    use crate::session::SessionRegistry;
    use crate::transport::message::ReplyStatus;

    const PATH: &str = "/ws/brain-waves";

    struct Quiet;
    impl MemoryProbe for Quiet {
        fn usage_ratio(&self) -> Option<f64> { Some(0.2) }
    }

    struct Fixed;
    impl Generator for Fixed {
        async fn predict(&self, _s: Vec<f32>, _t: Duration) -> Result<String, GenerateError> {
            Ok("UklGRg==".to_string())
        }
    }

    async fn start(max_sessions: usize) -> (String, Arc<Engine<Fixed>>) {
        let registry = SessionRegistry::new();
        let limits = GovernorLimits {
            max_sessions,
            pressure_session_ratio: 1.0,
            memory_warning:         0.75,
            memory_ceiling:         0.90,
            pressure_idle_timeout:  Duration::from_secs(45),
            emergency_idle_timeout: Duration::from_secs(30),
        };
        let governor = Arc::new(ResourceGovernor::new(registry.clone(), limits, Box::new(Quiet)));
        let engine = Arc::new(Engine::new(registry, Arc::new(Fixed), governor));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run(listener, PATH.to_string(), Arc::clone(&engine)));
        (format!("ws://{addr}{PATH}"), engine)
    }

    async fn next_reply<S>(ws: &mut S) -> Reply
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match ws.next().await.expect("stream open").expect("frame") {
                Message::Text(t) => return serde_json::from_str(&t).expect("reply json"),
                _ => continue,
            }
        }
    }

    fn packet(n: usize) -> Message {
        Message::Text(json!({ "timestamp": 1, "signalData": vec![0.25f32; n] }).to_string())
    }

    #[tokio::test]
    async fn buffers_then_generates() {
        let (url, engine) = start(10).await;
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

        ws.send(packet(1000)).await.unwrap();
        let r = next_reply(&mut ws).await;
        assert_eq!(r.status, ReplyStatus::Buffering);
        assert_eq!(engine.registry().count(), 1);

        ws.send(Message::Text("{oops".into())).await.unwrap();
        let r = next_reply(&mut ws).await;
        assert_eq!(r.status, ReplyStatus::Error);
        assert_eq!(r.message, "Invalid message format");

        ws.send(Message::Text(r#"{"timestamp": 2}"#.into())).await.unwrap();
        let r = next_reply(&mut ws).await;
        assert_eq!(r.status, ReplyStatus::Error);
        assert!(r.message.starts_with("Invalid EEG data"), "{}", r.message);

        ws.send(packet(280)).await.unwrap();
        let r = next_reply(&mut ws).await;
        assert_eq!(r.status, ReplyStatus::Success);
        assert_eq!(r.audio_base64.as_deref(), Some("UklGRg=="));
    }

    #[tokio::test]
    async fn close_removes_session() {
        let (url, engine) = start(10).await;
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        ws.send(packet(10)).await.unwrap();
        next_reply(&mut ws).await;
        assert_eq!(engine.registry().count(), 1);

        ws.close(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.registry().count() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session removed after close");
    }

    #[tokio::test]
    async fn rejects_beyond_capacity() {
        let (url, _engine) = start(1).await;
        let (mut first, _) = connect_async(url.as_str()).await.unwrap();
        first.send(packet(10)).await.unwrap();
        next_reply(&mut first).await;

        let (mut second, _) = connect_async(url.as_str()).await.unwrap();
        match second.next().await {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Again),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reclaimed_session_closes_its_connection() {
        let (url, engine) = start(10).await;
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        ws.send(packet(10)).await.unwrap();
        next_reply(&mut ws).await;

        let ids = engine.registry().list_active();
        assert_eq!(ids.len(), 1);
        // Same effect as an idle or pressure sweep catching this session.
        engine.registry().remove(ids[0].as_str()).expect("live session");

        let _ = ws.send(packet(10)).await;
        let code = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(Some(frame)))) => return Some(frame.code),
                    Some(Ok(_)) => continue,
                    _ => return None,
                }
            }
        })
        .await
        .expect("connection closed by the server");
        assert_eq!(code, Some(CloseCode::Again));
        assert_eq!(engine.registry().count(), 0);
    }

    #[tokio::test]
    async fn unknown_path_is_refused() {
        let (url, _engine) = start(10).await;
        let wrong = url.replace(PATH, "/elsewhere");
        assert!(connect_async(wrong.as_str()).await.is_err());
    }
}
