//! Shared test members.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use trellis_core::PathSpec;
use trellis_engine::*;

pub fn path(expr: &str) -> PathSpec {
    PathSpec::parse(expr).unwrap()
}

/// Event log shared by several recorders, so cross-member ordering can be
/// checked.
pub type Log = Arc<Mutex<Vec<String>>>;

pub fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

/// A member that records every callback it sees.
pub struct Recorder {
    pub name: String,
    pub log: Log,
    pub not_applicable: bool,
    pub reject_prepare: Option<String>,
    pub reject_precommit: Option<String>,
    pub hang_commit: bool,
    /// Paused-clock delay before `prepare` answers.
    pub prepare_delay: Option<Duration>,
    /// Block appended from inside `prepare`.
    pub append: Option<Vec<Query>>,
    /// Signalled when `prepare` starts.
    pub entered: Arc<Notify>,
    /// When set, `prepare` waits for it before answering.
    pub gate: Option<Arc<Notify>>,
    /// Answer `Async` and respond from a task after this delay.
    pub answer_later: Option<Duration>,
    /// Ask for an abort from inside `prepare`.
    pub abort_in_prepare: Option<String>,
}

impl Recorder {
    pub fn new(name: &str, log: &Log) -> Self {
        Self {
            name: name.to_string(),
            log: Arc::clone(log),
            not_applicable: false,
            reject_prepare: None,
            reject_precommit: None,
            hang_commit: false,
            prepare_delay: None,
            append: None,
            entered: Arc::new(Notify::new()),
            gate: None,
            answer_later: None,
            abort_in_prepare: None,
        }
    }

    fn record(&self, event: String) {
        self.log.lock().push(format!("{}:{}", self.name, event));
    }

    /// Events of this recorder, without the name prefix.
    pub fn events(&self) -> Vec<String> {
        let prefix = format!("{}:", self.name);
        self.log
            .lock()
            .iter()
            .filter_map(|e| e.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(kind)).count()
    }
}

#[async_trait]
impl MemberCallbacks for Recorder {
    async fn prepare(&self, ctx: &PrepareContext) -> PrepareStatus {
        let query = ctx.query();
        self.record(format!("prepare {} {}", query.action, query.path));
        self.entered.notify_one();

        if let Some(queries) = &self.append {
            ctx.append_block(queries.clone()).unwrap();
        }
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(delay) = self.prepare_delay {
            tokio::time::sleep(delay).await;
            self.record(format!("prepared {}", query.path));
        }
        if let Some(reason) = &self.abort_in_prepare {
            ctx.abort(reason.clone()).unwrap();
        }
        if self.not_applicable {
            return PrepareStatus::NotApplicable;
        }
        if let Some(reason) = &self.reject_prepare {
            return PrepareStatus::NotOk(reason.clone());
        }
        if let Some(delay) = self.answer_later {
            let handle = ctx.handle();
            let keyspec = query.path.clone();
            let name = self.name.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                handle.respond(keyspec, vec![json!({ "from": name, "late": true })], false);
            });
            return PrepareStatus::Async;
        }
        ctx.handle().respond(
            query.path.clone(),
            vec![json!({ "from": self.name })],
            false,
        );
        PrepareStatus::Ok
    }

    async fn precommit(&self, txn: TxnId) -> Vote {
        self.record(format!("precommit {}", txn));
        match &self.reject_precommit {
            Some(reason) => Vote::NotOk(reason.clone()),
            None => Vote::Ok,
        }
    }

    async fn commit(&self, txn: TxnId) -> Vote {
        self.record(format!("commit {}", txn));
        if self.hang_commit {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Vote::Ok
    }

    async fn abort(&self, txn: TxnId) {
        self.record(format!("abort {}", txn));
    }

    async fn recover(&self, txn: TxnId, report: &FailureReport) {
        self.record(format!("recover {} ({} failed)", txn, report.failed.len()));
    }
}

pub async fn connect(engine: &Engine, address: &str, recorder: &Arc<Recorder>) -> Arc<Member> {
    let callbacks: Arc<dyn MemberCallbacks> = recorder.clone();
    engine.connect(address, Some(callbacks)).await
}
