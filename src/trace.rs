//! Run trace artifact: a JSON array of scheduling events.
//!
//! Events are appended from several threads (scheduler dispatch, workers,
//! result processing) behind one mutex. The file is a single top-level
//! JSON array so downstream tooling can load it without a streaming
//! parser; [`TraceWriter::finish`] writes the closing bracket.

use std::io::{BufWriter, Write};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, WorkflowId};

/// Event kinds recorded in `trace.json`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceKind {
    NodeRunnable,
    NodeQueued,
    AttemptStart,
    AttemptFinish,
    AttemptFail,
    AttemptCancel,
    HedgeLaunched,
    WorkflowDone,
}

impl TraceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TraceKind::NodeRunnable => "NodeRunnable",
            TraceKind::NodeQueued => "NodeQueued",
            TraceKind::AttemptStart => "AttemptStart",
            TraceKind::AttemptFinish => "AttemptFinish",
            TraceKind::AttemptFail => "AttemptFail",
            TraceKind::AttemptCancel => "AttemptCancel",
            TraceKind::HedgeLaunched => "HedgeLaunched",
            TraceKind::WorkflowDone => "WorkflowDone",
        }
    }
}

/// One trace record. `extra` is free-form context (tier label, error kind).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceRecord {
    pub ev: String,
    pub t_ms: f64,
    pub wf: WorkflowId,
    pub node: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

struct TraceState<W: Write> {
    out: BufWriter<W>,
    first: bool,
    finished: bool,
}

/// Mutex-guarded JSON-array writer shared by every emitting thread.
pub struct TraceWriter<W: Write> {
    state: Mutex<TraceState<W>>,
}

impl<W: Write> TraceWriter<W> {
    pub fn new(out: W) -> std::io::Result<Self> {
        let mut buf = BufWriter::new(out);
        buf.write_all(b"[\n")?;
        Ok(Self {
            state: Mutex::new(TraceState {
                out: buf,
                first: true,
                finished: false,
            }),
        })
    }

    /// Append one event. IO errors are swallowed: tracing must never take
    /// down a run.
    pub fn emit(&self, kind: TraceKind, t_ms: f64, wf: WorkflowId, node: NodeId, extra: &str) {
        let record = TraceRecord {
            ev: kind.as_str().to_string(),
            t_ms,
            wf,
            node,
            extra: if extra.is_empty() {
                None
            } else {
                Some(extra.to_string())
            },
        };
        let mut state = self.state.lock().expect("TraceWriter mutex poisoned");
        if state.finished {
            return;
        }
        if !state.first {
            let _ = state.out.write_all(b",\n");
        }
        state.first = false;
        let _ = state.out.write_all(b"  ");
        let _ = serde_json::to_writer(&mut state.out, &record);
    }

    /// Lock with poison recovery. `finish` also runs from Drop, where a
    /// panic risks a process abort; a poisoned trace is still worth
    /// closing.
    fn lock_or_recover(&self) -> std::sync::MutexGuard<'_, TraceState<W>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }

    /// Close the array and flush. Idempotent; called once at shutdown
    /// after every emitting thread has been joined.
    pub fn finish(&self) -> std::io::Result<()> {
        let mut state = self.lock_or_recover();
        if state.finished {
            return Ok(());
        }
        state.finished = true;
        state.out.write_all(b"\n]\n")?;
        state.out.flush()
    }
}

impl<W: Write> Drop for TraceWriter<W> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}
