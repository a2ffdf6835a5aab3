//! Schema loader client.
//!
//! Walks through the loading phases using nothing but the query API. Each
//! phase waits for its listening peer to publish a readiness record, then
//! creates one status record per module of that phase in a single
//! transaction.

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::tasks::{MemberTasks, ScheduledTask};
use crate::types::*;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use trellis_core::{PathSpec, Segment};

/// Loader progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoaderPhase {
    LoadingApps,
    LoadingMgmt,
    LoadingNb,
    Done,
}

impl LoaderPhase {
    pub fn next(self) -> Self {
        match self {
            LoaderPhase::LoadingApps => LoaderPhase::LoadingMgmt,
            LoaderPhase::LoadingMgmt => LoaderPhase::LoadingNb,
            LoaderPhase::LoadingNb | LoaderPhase::Done => LoaderPhase::Done,
        }
    }

    /// Name of the peer whose readiness gates this phase.
    pub fn peer(self) -> &'static str {
        match self {
            LoaderPhase::LoadingApps => "apps",
            LoaderPhase::LoadingMgmt => "mgmt",
            LoaderPhase::LoadingNb => "nb",
            LoaderPhase::Done => "",
        }
    }
}

impl fmt::Display for LoaderPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoaderPhase::LoadingApps => "LOADING_APPS",
            LoaderPhase::LoadingMgmt => "LOADING_MGMT",
            LoaderPhase::LoadingNb => "LOADING_NB",
            LoaderPhase::Done => "DONE",
        };
        write!(f, "{}", name)
    }
}

/// What one attempt at a phase came to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// Status records created; the loader moved on.
    Advanced,
    /// The readiness record is not there yet.
    PeersMissing,
    /// The readiness read or the status writes did not commit.
    TransactionFailed(String),
}

/// Modules to load, per phase.
#[derive(Debug, Clone, Default)]
pub struct LoaderPlan {
    pub apps: Vec<String>,
    pub mgmt: Vec<String>,
    pub nb: Vec<String>,
}

impl LoaderPlan {
    fn modules(&self, phase: LoaderPhase) -> &[String] {
        match phase {
            LoaderPhase::LoadingApps => &self.apps,
            LoaderPhase::LoadingMgmt => &self.mgmt,
            LoaderPhase::LoadingNb => &self.nb,
            LoaderPhase::Done => &[],
        }
    }
}

pub struct SchemaLoader {
    engine: Arc<Engine>,
    plan: LoaderPlan,
    readiness_root: PathSpec,
    status_root: PathSpec,
    retry_short: Duration,
    retry_idle: Duration,
    phase: watch::Sender<LoaderPhase>,
}

impl SchemaLoader {
    /// Readiness records live under `/trellis/readiness/peer[name=...]` and
    /// status records under `/trellis/schema/module[name=...]`.
    pub fn new(engine: Arc<Engine>, plan: LoaderPlan) -> Self {
        let config: &EngineConfig = engine.config();
        let (retry_short, retry_idle) = (config.retry_short(), config.retry_idle());
        let (phase, _) = watch::channel(LoaderPhase::LoadingApps);
        Self {
            engine,
            plan,
            readiness_root: PathSpec::new(vec![Segment::new("trellis"), Segment::new("readiness")]),
            status_root: PathSpec::new(vec![Segment::new("trellis"), Segment::new("schema")]),
            retry_short,
            retry_idle,
            phase,
        }
    }

    pub fn with_roots(mut self, readiness_root: PathSpec, status_root: PathSpec) -> Self {
        self.readiness_root = readiness_root;
        self.status_root = status_root;
        self
    }

    pub fn phase(&self) -> LoaderPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoaderPhase> {
        self.phase.subscribe()
    }

    /// Path of the readiness record gating `phase`.
    pub fn readiness_path(&self, phase: LoaderPhase) -> PathSpec {
        self.readiness_root
            .join(Segment::new("peer").with_key("name", phase.peer()))
    }

    /// Path of the status record for `module`.
    pub fn status_path(&self, module: &str) -> PathSpec {
        self.status_root
            .join(Segment::new("module").with_key("name", module))
    }

    /// One attempt at the current phase.
    pub async fn step(&self) -> Attempt {
        let phase = self.phase();
        if phase == LoaderPhase::Done {
            return Attempt::Advanced;
        }

        let read = self.engine.begin();
        let readiness = Query::read(self.readiness_path(phase));
        if let Err(e) = read.append_block(vec![readiness]) {
            return Attempt::TransactionFailed(e.to_string());
        }
        read.commit();
        let ready = match read.results().await {
            Ok(results) => results.iter().any(|r| !r.records.is_empty()),
            Err(e) => return Attempt::TransactionFailed(e.to_string()),
        };
        if !ready {
            debug!("{}: peer {} not ready", phase, phase.peer());
            return Attempt::PeersMissing;
        }

        let status = phase.to_string();
        let creates = self
            .plan
            .modules(phase)
            .iter()
            .map(|module| {
                Query::create(
                    self.status_path(module),
                    json!({ "module": module, "phase": status, "loaded": true }),
                )
            })
            .collect::<Vec<_>>();
        if !creates.is_empty() {
            let write = self.engine.begin();
            if let Err(e) = write.append_block(creates) {
                return Attempt::TransactionFailed(e.to_string());
            }
            write.commit();
            if let Err(e) = write.results().await {
                return Attempt::TransactionFailed(e.to_string());
            }
        }

        let next = phase.next();
        info!("Schema loader {} -> {}", phase, next);
        self.phase.send_replace(next);
        Attempt::Advanced
    }

    /// Step until done, backing off between failed attempts.
    pub async fn run(&self) {
        while self.phase() != LoaderPhase::Done {
            match self.step().await {
                Attempt::Advanced => {}
                Attempt::PeersMissing => tokio::time::sleep(self.retry_short).await,
                Attempt::TransactionFailed(reason) => {
                    warn!("Schema loader {} attempt failed: {}", self.phase(), reason);
                    tokio::time::sleep(self.retry_idle).await;
                }
            }
        }
    }

    /// Run the loader as a task owned by `tasks`, so it stops when its
    /// owner goes away.
    pub fn spawn(self: Arc<Self>, tasks: &MemberTasks) -> ScheduledTask {
        tasks.spawn(async move { self.run().await })
    }
}
