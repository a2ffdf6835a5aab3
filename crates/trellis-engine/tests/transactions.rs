//! End-to-end transaction tests: phase ordering, aborts, commit failures
//! and block sequencing across real members.

mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use trellis_core::{Action, QueryFlags};
use trellis_engine::*;

async fn register(engine: &Engine, member: &Arc<Member>, expr: &str) {
    engine
        .register(member, path(expr), Capabilities::PUBLISHER, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_commit_runs_every_phase_once() {
    let engine = Engine::default();
    let log = log();
    let a = Arc::new(Recorder::new("a", &log));
    let member = connect(&engine, "peer://a", &a).await;
    register(&engine, &member, "/cfg/item[*]").await;

    let handle = engine.query(
        path("/cfg/item[id=1]"),
        Action::Update,
        Some(json!({"mtu": 9000})),
        QueryFlags::empty(),
    );
    let results = handle.results().await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].targets(), vec![member.id()]);
    assert_eq!(results[0].records[0].payload, Some(json!({"from": "a"})));
    assert_eq!(
        a.events(),
        vec![
            "prepare UPDATE /cfg/item[id=1]".to_string(),
            format!("precommit {}", handle.id()),
            format!("commit {}", handle.id()),
        ]
    );
    assert_eq!(
        handle.state_history(),
        vec![
            TxnState::Unsent,
            TxnState::Prepare,
            TxnState::Precommit,
            TxnState::Commit,
            TxnState::Done
        ]
    );
    assert!(matches!(handle.get_result(None), ResultStatus::Ready(r) if r.len() == 1));
}

#[tokio::test(start_paused = true)]
async fn test_appended_block_waits_for_previous_block() {
    let engine = Engine::default();
    let log = log();
    let mut first = Recorder::new("a", &log);
    first.prepare_delay = Some(Duration::from_millis(100));
    first.append = Some(vec![Query::read(path("/b/y"))]);
    let a = Arc::new(first);
    let b = Arc::new(Recorder::new("b", &log));
    let ma = connect(&engine, "peer://a", &a).await;
    let mb = connect(&engine, "peer://b", &b).await;
    register(&engine, &ma, "/a/x").await;
    register(&engine, &mb, "/b/y").await;

    let results = engine
        .query(path("/a/x"), Action::Read, None, QueryFlags::empty())
        .results()
        .await
        .unwrap();

    let events = log.lock().clone();
    let finished = events.iter().position(|e| e == "a:prepared /a/x").unwrap();
    let started = events
        .iter()
        .position(|e| e == "b:prepare READ /b/y")
        .unwrap();
    assert!(finished < started, "block 2 started early: {:?}", events);

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].path, path("/a/x"));
    assert_eq!(results[1].path, path("/b/y"));
    assert!(results[0].query < results[1].query);
    assert_eq!(a.count("precommit"), 1);
    assert_eq!(b.count("commit"), 1);
}

#[tokio::test]
async fn test_prepare_rejection_aborts() {
    let engine = Engine::default();
    let log = log();
    let a = Arc::new(Recorder::new("a", &log));
    let mut rejecting = Recorder::new("b", &log);
    rejecting.reject_prepare = Some("locked".into());
    let b = Arc::new(rejecting);
    let ma = connect(&engine, "peer://a", &a).await;
    let mb = connect(&engine, "peer://b", &b).await;
    register(&engine, &ma, "/cfg/item[*]").await;
    register(&engine, &mb, "/cfg/item[*]").await;

    let handle = engine.query(
        path("/cfg/item[id=3]"),
        Action::Delete,
        None,
        QueryFlags::empty(),
    );
    let TransactionOutcome::Aborted(reason) = handle.wait().await else {
        panic!("expected abort");
    };
    assert_eq!(reason.status, AbortStatus::Rejected);
    assert_eq!(reason.member, Some(mb.id()));
    assert_eq!(reason.phase, TxnState::Prepare);
    assert_eq!(reason.reason, "locked");

    assert_eq!(a.count("precommit") + b.count("precommit"), 0);
    assert_eq!(a.count("abort"), 1);
    assert_eq!(b.count("abort"), 1);
    assert!(matches!(
        handle.results().await,
        Err(EngineError::Aborted { .. })
    ));
    assert!(matches!(handle.get_result(None), ResultStatus::Aborted(_)));
}

#[tokio::test]
async fn test_precommit_rejection_aborts_without_commit() {
    let engine = Engine::default();
    let log = log();
    let a = Arc::new(Recorder::new("a", &log));
    let mut rejecting = Recorder::new("b", &log);
    rejecting.reject_precommit = Some("disk full".into());
    let b = Arc::new(rejecting);
    let ma = connect(&engine, "peer://a", &a).await;
    let mb = connect(&engine, "peer://b", &b).await;
    register(&engine, &ma, "/cfg/item[*]").await;
    register(&engine, &mb, "/cfg/item[*]").await;

    let handle = engine.query(
        path("/cfg/item[id=1]"),
        Action::Update,
        Some(json!({"mtu": 1500})),
        QueryFlags::empty(),
    );
    let TransactionOutcome::Aborted(reason) = handle.wait().await else {
        panic!("expected abort");
    };
    assert_eq!(reason.status, AbortStatus::Rejected);
    assert_eq!(reason.member, Some(mb.id()));
    assert_eq!(reason.phase, TxnState::Precommit);

    assert_eq!(a.count("commit") + b.count("commit"), 0);
    assert_eq!(a.count("abort"), 1);
    assert_eq!(b.count("abort"), 1);
    assert_eq!(
        handle.state_history(),
        vec![
            TxnState::Unsent,
            TxnState::Prepare,
            TxnState::Precommit,
            TxnState::Abort,
            TxnState::Aborted
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_commit_timeout_fails_without_retry() {
    let engine = Engine::default();
    let log = log();
    let mut hanging = Recorder::new("a", &log);
    hanging.hang_commit = true;
    let a = Arc::new(hanging);
    let b = Arc::new(Recorder::new("b", &log));
    let ma = connect(&engine, "peer://a", &a).await;
    let mb = connect(&engine, "peer://b", &b).await;
    register(&engine, &ma, "/cfg/item[*]").await;
    register(&engine, &mb, "/cfg/item[*]").await;

    let handle = engine.query(
        path("/cfg/item[id=1]"),
        Action::Update,
        Some(json!({"mtu": 1500})),
        QueryFlags::empty(),
    );
    let TransactionOutcome::Failed(report) = handle.wait().await else {
        panic!("expected failure");
    };
    assert_eq!(
        report.failed,
        vec![(ma.id(), "no answer to COMMIT".to_string())]
    );
    assert_eq!(a.count("commit"), 1);
    assert_eq!(a.count("recover"), 1);
    assert_eq!(b.count("recover"), 1);
    assert_eq!(a.count("abort") + b.count("abort"), 0);

    let history = handle.state_history();
    assert_eq!(&history[history.len() - 2..], &[TxnState::Commit, TxnState::Failed]);
    assert!(matches!(handle.get_result(None), ResultStatus::Failed(_)));
    assert!(matches!(
        handle.results().await,
        Err(EngineError::Inconsistent { .. })
    ));
    assert!(matches!(
        handle.abort(AbortStatus::Cancelled, "too late"),
        Err(EngineError::AbortRefused(_))
    ));
}

#[tokio::test]
async fn test_originator_abort_cancels_in_flight_block() {
    let engine = Engine::default();
    let log = log();
    let mut gated = Recorder::new("a", &log);
    let gate = Arc::new(Notify::new());
    gated.gate = Some(Arc::clone(&gate));
    let a = Arc::new(gated);
    let ma = connect(&engine, "peer://a", &a).await;
    register(&engine, &ma, "/cfg/item[*]").await;

    let handle = engine.query(
        path("/cfg/item[id=1]"),
        Action::Read,
        None,
        QueryFlags::empty(),
    );
    a.entered.notified().await;
    handle.abort(AbortStatus::Cancelled, "operator").unwrap();

    let TransactionOutcome::Aborted(reason) = handle.wait().await else {
        panic!("expected abort");
    };
    assert_eq!(reason.status, AbortStatus::Cancelled);
    assert_eq!(reason.member, None);
    assert_eq!(reason.reason, "operator");
    assert_eq!(a.count("abort"), 1);
    assert_eq!(a.count("precommit"), 0);
}

#[tokio::test]
async fn test_abort_refused_after_commit() {
    let engine = Engine::default();
    let log = log();
    let a = Arc::new(Recorder::new("a", &log));
    let ma = connect(&engine, "peer://a", &a).await;
    register(&engine, &ma, "/cfg/item[*]").await;

    let handle = engine.query(
        path("/cfg/item[id=1]"),
        Action::Read,
        None,
        QueryFlags::empty(),
    );
    assert!(handle.wait().await.is_committed());
    assert!(matches!(
        handle.abort(AbortStatus::Cancelled, "late"),
        Err(EngineError::AbortRefused(_))
    ));
    assert!(matches!(
        handle.append_block(vec![Query::read(path("/cfg"))]),
        Err(EngineError::TransactionClosed(_))
    ));
}

#[tokio::test]
async fn test_dead_peer_bounces_as_timeout() {
    let engine = Engine::default();
    let log = log();
    let mut gated = Recorder::new("a", &log);
    let gate = Arc::new(Notify::new());
    gated.gate = Some(Arc::clone(&gate));
    let a = Arc::new(gated);
    let ma = connect(&engine, "peer://a", &a).await;
    register(&engine, &ma, "/cfg/item[*]").await;

    let handle = engine.query(
        path("/cfg/item[id=1]"),
        Action::Update,
        Some(json!({})),
        QueryFlags::empty(),
    );
    a.entered.notified().await;
    assert_eq!(engine.deregister_peer("peer://a").await, vec![ma.id()]);
    gate.notify_one();

    let TransactionOutcome::Aborted(reason) = handle.wait().await else {
        panic!("expected abort");
    };
    assert_eq!(reason.status, AbortStatus::Timeout);
    assert_eq!(reason.member, Some(ma.id()));
    assert_eq!(reason.phase, TxnState::Precommit);
    // A gone member is not called again.
    assert_eq!(a.count("precommit") + a.count("abort"), 0);
    assert!(!ma.is_alive());
}

#[tokio::test]
async fn test_not_applicable_members_change_nothing() {
    let engine = Engine::default();
    let log = log();
    let mut outsider = Recorder::new("a", &log);
    outsider.not_applicable = true;
    let a = Arc::new(outsider);
    let b = Arc::new(Recorder::new("b", &log));
    let ma = connect(&engine, "peer://a", &a).await;
    let mb = connect(&engine, "peer://b", &b).await;
    register(&engine, &ma, "/cfg/item[*]").await;
    register(&engine, &mb, "/cfg/item[*]").await;

    let results = engine
        .query(path("/cfg/item[id=7]"), Action::Read, None, QueryFlags::empty())
        .results()
        .await
        .unwrap();
    assert_eq!(results[0].targets(), vec![ma.id(), mb.id()]);
    assert_eq!(results[0].not_applicable(), vec![ma.id()]);
    assert_eq!(results[0].records.len(), 1);
    assert_eq!(results[0].records[0].member, mb.id());
}

#[tokio::test]
async fn test_results_by_correlation() {
    let engine = Engine::default();
    let log = log();
    let a = Arc::new(Recorder::new("a", &log));
    let ma = connect(&engine, "peer://a", &a).await;
    register(&engine, &ma, "/cfg/item[*]").await;

    let handle = engine.begin();
    handle
        .append_block(vec![
            Query::read(path("/cfg/item[id=1]")).with_correlation(1),
            Query::read(path("/cfg/item[id=2]")).with_correlation(2),
        ])
        .unwrap();
    assert!(matches!(handle.get_result(None), ResultStatus::Pending));
    handle.commit();
    handle.wait().await;

    let ResultStatus::Ready(results) = handle.get_result(Some(CorrelationId(2))) else {
        panic!("expected results");
    };
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].path, path("/cfg/item[id=2]"));
    assert_eq!(a.count("precommit"), 1);
}

#[tokio::test]
async fn test_rpc_reaches_one_member_and_never_vetoes() {
    let engine = Engine::default();
    let log = log();
    let mut busy = Recorder::new("a", &log);
    busy.reject_prepare = Some("busy".into());
    let a = Arc::new(busy);
    let b = Arc::new(Recorder::new("b", &log));
    let ma = connect(&engine, "peer://a", &a).await;
    let mb = connect(&engine, "peer://b", &b).await;
    register(&engine, &ma, "/ops/restart").await;
    register(&engine, &mb, "/ops/restart").await;

    let results = engine
        .query(
            path("/ops/restart"),
            Action::Rpc,
            Some(json!({"delay": 0})),
            QueryFlags::empty(),
        )
        .results()
        .await
        .unwrap();
    assert_eq!(results[0].targets(), vec![ma.id()]);
    assert_eq!(
        results[0].responses[0].reply,
        MemberReply::Rejected("busy".into())
    );
    assert_eq!(b.count("prepare"), 0);
    // RPC targets take no part in the commit protocol.
    assert_eq!(a.count("precommit") + a.count("commit"), 0);
}

#[tokio::test]
async fn test_anycast_and_subscribers() {
    let engine = Engine::default();
    let log = log();
    let a = Arc::new(Recorder::new("a", &log));
    let b = Arc::new(Recorder::new("b", &log));
    let s = Arc::new(Recorder::new("s", &log));
    let ma = connect(&engine, "peer://a", &a).await;
    let mb = connect(&engine, "peer://b", &b).await;
    let ms = connect(&engine, "peer://s", &s).await;
    register(&engine, &ma, "/cfg/item[*]").await;
    register(&engine, &mb, "/cfg/item[*]").await;
    engine
        .register(&ms, path("/cfg/item[*]"), Capabilities::SUBSCRIBER, None)
        .await
        .unwrap();

    let read = engine
        .query(path("/cfg/item[id=1]"), Action::Read, None, QueryFlags::ANYCAST)
        .results()
        .await
        .unwrap();
    assert_eq!(read[0].targets(), vec![ma.id()]);

    let create = engine
        .query(
            path("/cfg/item[id=1]"),
            Action::Create,
            Some(json!({})),
            QueryFlags::empty(),
        )
        .results()
        .await
        .unwrap();
    assert_eq!(create[0].targets(), vec![ma.id(), mb.id(), ms.id()]);
    assert_eq!(s.count("prepare READ"), 0);
    assert_eq!(s.count("prepare CREATE"), 1);
}

#[tokio::test]
async fn test_code_free_member_stores_entries() {
    let engine = Engine::default();
    let store = engine.connect("local://store", None).await;
    engine
        .register(&store, path("/cfg/item[*]"), Capabilities::PUBLISHER, None)
        .await
        .unwrap();
    let entry = path("/cfg/item[name='eth0']");

    engine
        .query(entry.clone(), Action::Create, Some(json!({"mtu": 1500, "up": true})), QueryFlags::empty())
        .results()
        .await
        .unwrap();
    engine
        .query(entry.clone(), Action::Update, Some(json!({"mtu": 9000})), QueryFlags::empty())
        .results()
        .await
        .unwrap();
    let table = store.virtual_table().unwrap();
    assert_eq!(table.get(&entry), Some(json!({"mtu": 9000, "up": true})));

    let read = engine
        .query(path("/cfg/item[*]"), Action::Read, None, QueryFlags::KEYONLY)
        .results()
        .await
        .unwrap();
    assert_eq!(read[0].records.len(), 1);
    assert_eq!(read[0].records[0].path, entry);
    assert_eq!(read[0].records[0].payload, None);

    // A second CREATE of the same entry is vetoed and changes nothing.
    let duplicate = engine
        .query(entry.clone(), Action::Create, Some(json!({})), QueryFlags::empty())
        .wait()
        .await;
    assert!(duplicate.is_aborted());
    assert_eq!(table.get(&entry), Some(json!({"mtu": 9000, "up": true})));

    engine
        .query(entry.clone(), Action::Delete, None, QueryFlags::empty())
        .results()
        .await
        .unwrap();
    assert!(table.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_prepare_aborts_as_timeout() {
    let engine = Engine::default();
    let log = log();
    let mut slow = Recorder::new("a", &log);
    slow.prepare_delay = Some(engine.config().prepare_timeout() + Duration::from_secs(1));
    let a = Arc::new(slow);
    let ma = connect(&engine, "peer://a", &a).await;
    register(&engine, &ma, "/cfg/item[*]").await;

    let handle = engine.query(
        path("/cfg/item[id=1]"),
        Action::Update,
        Some(json!({"mtu": 1500})),
        QueryFlags::empty(),
    );
    let TransactionOutcome::Aborted(reason) = handle.wait().await else {
        panic!("expected abort");
    };
    assert_eq!(reason.status, AbortStatus::Timeout);
    assert_eq!(reason.member, Some(ma.id()));
    assert_eq!(reason.phase, TxnState::Prepare);
    assert_eq!(a.count("prepared"), 0);
    assert_eq!(a.count("precommit"), 0);
    assert_eq!(a.count("abort"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_async_answer_arrives_on_cloned_handle() {
    let engine = Engine::default();
    let log = log();
    let mut later = Recorder::new("a", &log);
    later.answer_later = Some(Duration::from_secs(1));
    let a = Arc::new(later);
    let ma = connect(&engine, "peer://a", &a).await;
    register(&engine, &ma, "/cfg/item[*]").await;

    let results = engine
        .query(path("/cfg/item[id=1]"), Action::Read, None, QueryFlags::empty())
        .results()
        .await
        .unwrap();
    assert_eq!(results[0].records.len(), 1);
    assert_eq!(results[0].records[0].member, ma.id());
    assert_eq!(
        results[0].records[0].payload,
        Some(json!({"from": "a", "late": true}))
    );
    assert_eq!(a.count("commit"), 1);
}

#[tokio::test]
async fn test_member_abort_from_prepare() {
    let engine = Engine::default();
    let log = log();
    let mut quitter = Recorder::new("a", &log);
    quitter.abort_in_prepare = Some("inconsistent local state".into());
    let a = Arc::new(quitter);
    let b = Arc::new(Recorder::new("b", &log));
    let ma = connect(&engine, "peer://a", &a).await;
    let mb = connect(&engine, "peer://b", &b).await;
    register(&engine, &ma, "/cfg/item[*]").await;
    register(&engine, &mb, "/cfg/item[*]").await;

    let handle = engine.query(
        path("/cfg/item[id=1]"),
        Action::Update,
        Some(json!({})),
        QueryFlags::empty(),
    );
    let TransactionOutcome::Aborted(reason) = handle.wait().await else {
        panic!("expected abort");
    };
    assert_eq!(reason.status, AbortStatus::Cancelled);
    assert_eq!(reason.member, Some(ma.id()));
    assert_eq!(reason.phase, TxnState::Prepare);
    assert_eq!(reason.reason, "inconsistent local state");
    assert_eq!(a.count("precommit") + b.count("precommit"), 0);
    assert_eq!(a.count("abort"), 1);
    assert_eq!(b.count("abort"), 1);
}

fn stage(engine: &Engine, query: Query) -> TransactionHandle {
    let handle = engine.begin();
    handle.append_block(vec![query]).unwrap();
    handle
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_creates_commit_once() {
    let engine = Engine::default();
    let store = engine.connect("local://store", None).await;
    engine
        .register(&store, path("/cfg/item[*]"), Capabilities::PUBLISHER, None)
        .await
        .unwrap();
    let entry = path("/cfg/item[name='eth0']");

    let first = stage(&engine, Query::create(entry.clone(), json!({"owner": 1})));
    let second = stage(&engine, Query::create(entry.clone(), json!({"owner": 2})));
    // both have prepared against the empty store
    tokio::time::sleep(Duration::from_millis(10)).await;
    let table = store.virtual_table().unwrap();
    assert!(table.has_staged(first.id()) && table.has_staged(second.id()));

    first.commit();
    assert!(first.wait().await.is_committed());
    second.commit();
    let TransactionOutcome::Aborted(reason) = second.wait().await else {
        panic!("expected the second create to lose");
    };
    assert_eq!(reason.status, AbortStatus::Rejected);
    assert_eq!(reason.phase, TxnState::Precommit);
    assert_eq!(reason.member, Some(store.id()));
    assert_eq!(table.get(&entry), Some(json!({"owner": 1})));
    assert!(!table.has_staged(second.id()));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_merges_never_lose_an_update() {
    let engine = Engine::default();
    let store = engine.connect("local://store", None).await;
    engine
        .register(&store, path("/cfg/item[*]"), Capabilities::PUBLISHER, None)
        .await
        .unwrap();
    let entry = path("/cfg/item[name='eth0']");
    engine
        .query(entry.clone(), Action::Create, Some(json!({"base": 0})), QueryFlags::empty())
        .results()
        .await
        .unwrap();

    let first = stage(&engine, Query::update(entry.clone(), json!({"a": 1})));
    let second = stage(&engine, Query::update(entry.clone(), json!({"b": 2})));
    tokio::time::sleep(Duration::from_millis(10)).await;

    first.commit();
    assert!(first.wait().await.is_committed());
    second.commit();
    assert!(second.wait().await.is_aborted());

    let table = store.virtual_table().unwrap();
    assert_eq!(table.get(&entry), Some(json!({"base": 0, "a": 1})));

    // retried against the new state, the second update lands on top
    engine
        .query(entry.clone(), Action::Update, Some(json!({"b": 2})), QueryFlags::empty())
        .results()
        .await
        .unwrap();
    assert_eq!(table.get(&entry), Some(json!({"base": 0, "a": 1, "b": 2})));
}
