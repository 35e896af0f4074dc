//! Isolated evaluation context.
//!
//! The worker owns its own [`ShellSession`] on a separate tokio task. The
//! caller reaches it only through serialized messages: a request carries a
//! JSON [`ConstructionRecord`] and is answered with a JSON [`WorkerReply`].
//! Control messages travel on their own channel and are handled while a
//! request is in flight, so a long materialization stays interruptible.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{ErrorInfo, ShellError, ShellResult};
use crate::provider::ServiceProvider;
use crate::reconstruct::{reconstruct_cursor, ConstructionRecord};
use crate::session::{SessionConfig, ShellSession};
use crate::types::IterationSnapshot;

const REQUEST_QUEUE: usize = 16;

type Request = (String, oneshot::Sender<String>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Control {
    Interrupt,
    Resume,
    Shutdown,
}

/// Serialized answer to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum WorkerReply {
    Snapshot { snapshot: IterationSnapshot },
    Error { error: ErrorInfo },
}

fn stopped() -> ShellError {
    ShellError::Internal("evaluation worker has stopped".to_string())
}

/// Handle to a running evaluation context.
pub struct EvaluationWorker {
    requests: mpsc::Sender<Request>,
    control: mpsc::UnboundedSender<Control>,
    handle: JoinHandle<()>,
}

impl EvaluationWorker {
    /// Start a worker with its own session over `provider`.
    pub fn spawn(provider: Arc<dyn ServiceProvider>, config: SessionConfig) -> Self {
        let session = ShellSession::new(provider, config);
        let (requests, request_rx) = mpsc::channel(REQUEST_QUEUE);
        let (control, control_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(session, request_rx, control_rx));
        Self {
            requests,
            control,
            handle,
        }
    }

    /// Rebuild the cursor described by `record` inside the worker and run
    /// one top-level materialization there.
    pub async fn materialize(&self, record: &ConstructionRecord) -> ShellResult<IterationSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send((record.to_json()?, tx))
            .await
            .map_err(|_| stopped())?;
        let reply = rx.await.map_err(|_| stopped())?;
        match serde_json::from_str(&reply)? {
            WorkerReply::Snapshot { snapshot } => Ok(snapshot),
            WorkerReply::Error { error } => Err(error.into_error()),
        }
    }

    /// Raise the worker session's interrupt. Pending and later calls fail
    /// until [`resume`](Self::resume).
    pub fn interrupt(&self) -> ShellResult<()> {
        self.control.send(Control::Interrupt).map_err(|_| stopped())
    }

    pub fn resume(&self) -> ShellResult<()> {
        self.control.send(Control::Resume).map_err(|_| stopped())
    }

    /// Stop the worker, interrupting any request in flight.
    pub async fn shutdown(self) -> ShellResult<()> {
        let _ = self.control.send(Control::Shutdown);
        self.handle
            .await
            .map_err(|e| ShellError::Internal(format!("evaluation worker failed: {e}")))
    }
}

fn apply(session: &ShellSession, control: Control) {
    match control {
        Control::Interrupt => session.interrupt().set(),
        Control::Resume => session.interrupt().reset(),
        Control::Shutdown => {}
    }
}

async fn materialize(session: &Arc<ShellSession>, json: &str) -> ShellResult<IterationSnapshot> {
    let record = ConstructionRecord::from_json(json)?;
    let mut cursor = reconstruct_cursor(session, &record)?;
    cursor.it().await
}

async fn serve(session: &Arc<ShellSession>, json: String) -> String {
    let reply = match materialize(session, &json).await {
        Ok(snapshot) => WorkerReply::Snapshot { snapshot },
        Err(err) => WorkerReply::Error {
            error: err.to_info(),
        },
    };
    serde_json::to_string(&reply).unwrap_or_else(|e| {
        json!({"status": "error", "error": {"kind": "internal", "message": e.to_string()}})
            .to_string()
    })
}

async fn run(
    session: Arc<ShellSession>,
    mut requests: mpsc::Receiver<Request>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    log::debug!("evaluation worker started");
    let mut stopping = false;
    while !stopping {
        tokio::select! {
            biased;
            msg = control.recv() => match msg {
                Some(Control::Shutdown) | None => stopping = true,
                Some(msg) => apply(&session, msg),
            },
            req = requests.recv() => {
                let Some((json, reply)) = req else { break };
                let work = serve(&session, json);
                tokio::pin!(work);
                let out = loop {
                    tokio::select! {
                        biased;
                        msg = control.recv(), if !stopping => match msg {
                            Some(Control::Shutdown) | None => {
                                stopping = true;
                                session.interrupt().set();
                            }
                            Some(msg) => apply(&session, msg),
                        },
                        out = &mut work => break out,
                    }
                };
                if reply.send(out).is_err() {
                    log::warn!("evaluation worker reply dropped: caller went away");
                }
            }
        }
    }
    log::debug!("evaluation worker stopped");
}
