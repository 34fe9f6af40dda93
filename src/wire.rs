//! Newline-delimited JSON protocol.
//!
//! Every line is one request object tagged by `op`. The first line must be
//! `hello` with the server password. Replies are `{"ok":true,"data":...}` or
//! `{"ok":false,"error":{"kind":...,"message":...}}`. After `subscribe`,
//! committed events for that resource are pushed as `{"event":...}` lines,
//! interleaved with replies.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, NaiveTime};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability;

const PUSH_BUFFER: usize = 256;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Hello {
        password: String,
    },
    RegisterActor {
        actor: Actor,
    },
    DeactivateActor {
        id: Ulid,
    },
    RegisterResource {
        #[serde(default)]
        id: Option<Ulid>,
        name: String,
        kind: ResourceKind,
        capacity: u32,
    },
    UpdateResource {
        id: Ulid,
        name: String,
        kind: ResourceKind,
        capacity: u32,
    },
    SetResourceStatus {
        id: Ulid,
        status: ResourceStatus,
    },
    ListResources,
    CreateReservation {
        resource_id: Ulid,
        date: NaiveDate,
        window: WireWindow,
        requester: Ulid,
    },
    Transition {
        id: Ulid,
        actor: Ulid,
        to: Status,
        #[serde(default)]
        reason: Option<String>,
    },
    BatchCreate {
        resource_id: Ulid,
        actor: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        window: WireWindow,
    },
    GetReservation {
        id: Ulid,
    },
    ListBlocking {
        resource_id: Ulid,
        date: NaiveDate,
    },
    ListDay {
        resource_id: Ulid,
        date: NaiveDate,
    },
    ListMine {
        requester: Ulid,
    },
    ApprovalQueue {
        actor: Ulid,
    },
    Subscribe {
        resource_id: Ulid,
    },
}

/// Time window as sent by clients: `"HH:MM"` or `"HH:MM:SS"` strings.
#[derive(Debug, Clone, Deserialize)]
pub struct WireWindow {
    pub start: String,
    pub end: String,
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

impl WireWindow {
    fn parse(&self) -> Result<TimeWindow, Failure> {
        match (parse_time(&self.start), parse_time(&self.end)) {
            (Some(start), Some(end)) => Ok(TimeWindow::new(start, end)),
            _ => Err(Failure::new(
                "validation",
                format!("bad time window {}-{}: expected HH:MM", self.start, self.end),
            )),
        }
    }
}

// ── Replies ──────────────────────────────────────────────

#[derive(Serialize)]
struct Reply<'a, T: Serialize> {
    ok: bool,
    data: &'a T,
}

#[derive(Serialize)]
struct ErrorReply<'a> {
    ok: bool,
    error: ErrorBody<'a>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    kind: &'a str,
    message: &'a str,
}

#[derive(Serialize)]
struct Push<'a> {
    event: &'a Event,
}

#[derive(Serialize)]
struct Welcome {
    server: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct Subscribed {
    resource_id: Ulid,
}

const FALLBACK_ERROR: &str =
    r#"{"ok":false,"error":{"kind":"internal","message":"failed to encode reply"}}"#;

fn ok_line<T: Serialize>(data: &T) -> String {
    serde_json::to_string(&Reply { ok: true, data }).unwrap_or_else(|_| FALLBACK_ERROR.into())
}

fn error_line(kind: &str, message: &str) -> String {
    serde_json::to_string(&ErrorReply {
        ok: false,
        error: ErrorBody { kind, message },
    })
    .unwrap_or_else(|_| FALLBACK_ERROR.into())
}

fn push_line(event: &Event) -> String {
    serde_json::to_string(&Push { event }).unwrap_or_else(|_| FALLBACK_ERROR.into())
}

/// A request that failed, ready to report.
#[derive(Debug)]
struct Failure {
    kind: &'static str,
    message: String,
}

impl Failure {
    fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<EngineError> for Failure {
    fn from(e: EngineError) -> Self {
        Failure::new(e.kind(), e.to_string())
    }
}

// ── Connection ───────────────────────────────────────────

/// Shared state handed to every connection.
pub struct ServerContext {
    pub engine: Arc<Engine>,
    pub password: String,
}

/// Event forwarders for one connection. Aborted when the connection ends.
struct Subscriptions {
    tx: mpsc::Sender<Event>,
    active: HashMap<Ulid, JoinHandle<()>>,
}

impl Subscriptions {
    fn add(&mut self, resource_id: Ulid, mut rx: broadcast::Receiver<Event>) {
        if self.active.contains_key(&resource_id) {
            return;
        }
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("subscriber for {resource_id} lagged, {n} events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.active.insert(resource_id, handle);
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        for handle in self.active.values() {
            handle.abort();
        }
    }
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "line too long")
        }
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection<S>(socket: S, ctx: Arc<ServerContext>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    let Some(first) = framed.next().await else {
        return Ok(());
    };
    let first = first.map_err(codec_err)?;
    match serde_json::from_str::<Request>(&first) {
        Ok(Request::Hello { password }) if password == ctx.password => {
            let welcome = Welcome {
                server: "roomgate",
                version: env!("CARGO_PKG_VERSION"),
            };
            framed.send(ok_line(&welcome)).await.map_err(codec_err)?;
        }
        Ok(Request::Hello { .. }) => {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            framed
                .send(error_line("unauthorized", "password authentication failed"))
                .await
                .map_err(codec_err)?;
            return Ok(());
        }
        _ => {
            framed
                .send(error_line("protocol", "expected hello as first request"))
                .await
                .map_err(codec_err)?;
            return Ok(());
        }
    }

    let (push_tx, mut push_rx) = mpsc::channel::<Event>(PUSH_BUFFER);
    let mut subs = Subscriptions {
        tx: push_tx,
        active: HashMap::new(),
    };

    loop {
        tokio::select! {
            line = framed.next() => {
                let reply = match line {
                    None => break,
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => handle_line(&ctx, &line, &mut subs).await,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        error_line("protocol", "request line too long")
                    }
                    Some(Err(LinesCodecError::Io(e))) => return Err(e),
                };
                framed.send(reply).await.map_err(codec_err)?;
            }
            Some(event) = push_rx.recv() => {
                framed.send(push_line(&event)).await.map_err(codec_err)?;
            }
        }
    }
    Ok(())
}

async fn handle_line(ctx: &ServerContext, line: &str, subs: &mut Subscriptions) -> String {
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => "unknown", "status" => "protocol")
                .increment(1);
            return error_line("protocol", &format!("bad request: {e}"));
        }
    };
    let op = observability::request_label(&req);
    let started = Instant::now();
    let result = execute(ctx, req, subs).await;
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(reply) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => "ok")
                .increment(1);
            reply
        }
        Err(f) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => f.kind)
                .increment(1);
            debug!(op, kind = f.kind, "request failed: {}", f.message);
            error_line(f.kind, &f.message)
        }
    }
}

async fn execute(
    ctx: &ServerContext,
    req: Request,
    subs: &mut Subscriptions,
) -> Result<String, Failure> {
    let engine = &ctx.engine;
    match req {
        Request::Hello { .. } => Err(Failure::new("protocol", "already authenticated")),
        Request::RegisterActor { actor } => Ok(ok_line(&engine.register_actor(actor).await?)),
        Request::DeactivateActor { id } => Ok(ok_line(&engine.deactivate_actor(id).await?)),
        Request::RegisterResource {
            id,
            name,
            kind,
            capacity,
        } => {
            let id = id.unwrap_or_else(Ulid::new);
            Ok(ok_line(&engine.register_resource(id, name, kind, capacity).await?))
        }
        Request::UpdateResource {
            id,
            name,
            kind,
            capacity,
        } => Ok(ok_line(&engine.update_resource(id, name, kind, capacity).await?)),
        Request::SetResourceStatus { id, status } => {
            Ok(ok_line(&engine.set_resource_status(id, status).await?))
        }
        Request::ListResources => Ok(ok_line(&engine.list_resources())),
        Request::CreateReservation {
            resource_id,
            date,
            window,
            requester,
        } => {
            let window = window.parse()?;
            let r = engine
                .create_reservation(resource_id, date, window, requester)
                .await?;
            Ok(ok_line(&r))
        }
        Request::Transition {
            id,
            actor,
            to,
            reason,
        } => Ok(ok_line(&engine.transition(id, actor, to, reason).await?)),
        Request::BatchCreate {
            resource_id,
            actor,
            from,
            to,
            window,
        } => {
            let window = window.parse()?;
            let report = engine
                .batch_create(resource_id, actor, from, to, window)
                .await?;
            Ok(ok_line(&report))
        }
        Request::GetReservation { id } => Ok(ok_line(&engine.get_reservation(id).await?)),
        Request::ListBlocking { resource_id, date } => {
            Ok(ok_line(&engine.list_blocking(resource_id, date).await?))
        }
        Request::ListDay { resource_id, date } => {
            Ok(ok_line(&engine.list_day(resource_id, date).await?))
        }
        Request::ListMine { requester } => Ok(ok_line(&engine.list_for_requester(requester).await)),
        Request::ApprovalQueue { actor } => Ok(ok_line(&engine.approval_queue(actor).await?)),
        Request::Subscribe { resource_id } => {
            engine.get_resource_info(resource_id)?;
            subs.add(resource_id, engine.notify.subscribe(resource_id));
            Ok(ok_line(&Subscribed { resource_id }))
        }
    }
}
