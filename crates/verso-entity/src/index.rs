use std::sync::Arc;

use tokio::task::JoinHandle;

use verso_storage::{IndexOp, TableStore, VersionRow};
use verso_types::{Tuid, VersoError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Create,
    Update,
    Delete,
}

impl WriteKind {
    fn as_str(self) -> &'static str {
        match self {
            WriteKind::Create => "create",
            WriteKind::Update => "update",
            WriteKind::Delete => "delete",
        }
    }
}

/// How index ops are issued after the primary write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanOutMode {
    /// One detached task per op; ops fail independently.
    #[default]
    Independent,
    /// One detached task applying every op through the backend batch.
    Batched,
}

/// The primary half of a write set.
#[derive(Debug, Clone)]
pub enum PrimaryWrite {
    Put(VersionRow),
    DeleteAll,
}

/// Everything one entity write touches: the primary write, then index
/// inserts, retractions and counter increments. Only the primary write is
/// awaited by the caller.
#[derive(Debug, Clone)]
pub struct WriteSet {
    pub id: Tuid,
    pub kind: WriteKind,
    pub primary: PrimaryWrite,
    pub inserts: Vec<IndexOp>,
    pub retracts: Vec<IndexOp>,
    pub counters: Vec<IndexOp>,
}

impl WriteSet {
    pub fn new(id: Tuid, kind: WriteKind, primary: PrimaryWrite) -> Self {
        WriteSet { id, kind, primary, inserts: Vec::new(), retracts: Vec::new(), counters: Vec::new() }
    }

    /// Index ops in issue order.
    pub fn index_ops(&self) -> impl Iterator<Item = &IndexOp> {
        self.inserts.iter().chain(&self.retracts).chain(&self.counters)
    }

    fn into_index_ops(self) -> Vec<IndexOp> {
        let mut ops = self.inserts;
        ops.extend(self.retracts);
        ops.extend(self.counters);
        ops
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutFailure {
    /// Index or counter name.
    pub target: String,
    pub retraction: bool,
    pub error: String,
}

/// Outcome of every index op of one write.
#[derive(Debug, Clone)]
pub struct FanOutReport {
    pub id: Tuid,
    pub kind: WriteKind,
    pub applied: usize,
    pub failed: Vec<FanOutFailure>,
}

impl FanOutReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// `PartialDeleteFailure` when a delete left index rows behind. Failed
    /// inserts of creates and updates are reported in `failed` only: the
    /// primary write stands regardless.
    pub fn into_result(self) -> Result<Self, VersoError> {
        let failed = self.failed.iter().filter(|f| f.retraction).count();
        if self.kind == WriteKind::Delete && failed > 0 {
            return Err(VersoError::PartialDeleteFailure { id: self.id, failed });
        }
        Ok(self)
    }
}

#[derive(Default)]
struct Outcome {
    applied: usize,
    failed: Vec<FanOutFailure>,
}

/// Handle on the index ops of one write, already running in the background.
/// Dropping it detaches them.
pub struct FanOut {
    id: Tuid,
    kind: WriteKind,
    planned: usize,
    tasks: Vec<JoinHandle<Outcome>>,
}

impl FanOut {
    pub fn planned(&self) -> usize {
        self.planned
    }

    /// Wait for every op to finish.
    pub async fn settle(self) -> FanOutReport {
        let mut report = FanOutReport { id: self.id, kind: self.kind, applied: 0, failed: Vec::new() };
        for task in self.tasks {
            match task.await {
                Ok(outcome) => {
                    report.applied += outcome.applied;
                    report.failed.extend(outcome.failed);
                }
                Err(e) => report.failed.push(FanOutFailure {
                    target: String::new(),
                    retraction: self.kind == WriteKind::Delete,
                    error: e.to_string(),
                }),
            }
        }
        report
    }
}

fn log_failure(id: Tuid, kind: WriteKind, op: &IndexOp, error: &VersoError) -> FanOutFailure {
    if kind == WriteKind::Delete && op.is_retraction() {
        tracing::error!(
            %id,
            index = op.target(),
            error = %error,
            partial_delete_failure = true,
            "index retraction failed after delete"
        );
    } else {
        tracing::warn!(%id, write = kind.as_str(), index = op.target(), error = %error, "index write failed");
    }
    FanOutFailure { target: op.target().to_string(), retraction: op.is_retraction(), error: error.to_string() }
}

/// Issue the index ops of `set` in the background. The primary write must
/// already have succeeded.
pub(crate) fn dispatch<S: TableStore>(tables: &Arc<S>, set: WriteSet, mode: FanOutMode) -> FanOut {
    let (id, kind) = (set.id, set.kind);
    let ops = set.into_index_ops();
    let planned = ops.len();
    let tasks = if ops.is_empty() {
        Vec::new()
    } else {
        match mode {
            FanOutMode::Independent => ops
                .into_iter()
                .map(|op| {
                    let tables = tables.clone();
                    tokio::spawn(async move {
                        match tables.apply_index_op(op.clone()).await {
                            Ok(()) => Outcome { applied: 1, failed: Vec::new() },
                            Err(e) => Outcome { applied: 0, failed: vec![log_failure(id, kind, &op, &e)] },
                        }
                    })
                })
                .collect(),
            FanOutMode::Batched => {
                let tables = tables.clone();
                vec![tokio::spawn(async move {
                    match tables.apply_index_batch(ops.clone()).await {
                        Ok(()) => Outcome { applied: ops.len(), failed: Vec::new() },
                        Err(e) => Outcome {
                            applied: 0,
                            failed: ops.iter().map(|op| log_failure(id, kind, op, &e)).collect(),
                        },
                    }
                })]
            }
        }
    };
    FanOut { id, kind, planned, tasks }
}
