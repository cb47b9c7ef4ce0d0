//! End-to-end tests against a real Chromium process.
//!
//! Ignored by default; run with `cargo test -- --ignored` on a machine with
//! Chrome or Chromium installed.

use browserpool_common::{NoGeoProvider, RunOptions, TaskStatus};
use browserpool_worker::{BrowserWorkerPool, Stats};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

async fn start_pool(run: RunOptions) -> (BrowserWorkerPool, CancellationToken) {
    let token = CancellationToken::new();
    let pool = BrowserWorkerPool::new(
        Stats::new(),
        run,
        Box::new(NoGeoProvider),
        token.clone(),
    );
    pool.launch_browser().await.unwrap();
    pool.run_task_manager();
    (pool, token)
}

async fn run_script(pool: &BrowserWorkerPool, script: &str) -> (TaskStatus, Value) {
    let (tx, rx) = oneshot::channel();
    pool.add_task(
        script,
        Box::new(move |status, payload, _| {
            let _ = tx.send((status, payload));
        }),
        None,
    );
    tokio::time::timeout(Duration::from_secs(60), rx)
        .await
        .expect("task did not settle")
        .expect("callback dropped")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore]
async fn resolved_value_reaches_callback() {
    let (pool, token) = start_pool(RunOptions::default()).await;

    let (status, payload) = run_script(&pool, "resolve(42);").await;
    assert_eq!(status, TaskStatus::Done);
    assert_eq!(payload["response"], 42);

    let (status, payload) = run_script(&pool, "resolve({ answer: 42 });").await;
    assert_eq!(status, TaskStatus::Done);
    assert_eq!(payload["answer"], 42);

    // Falling off the end settles with an empty object.
    let (status, payload) = run_script(&pool, "const a = 1;").await;
    assert_eq!(status, TaskStatus::Done);
    assert_eq!(payload, serde_json::json!({}));

    token.cancel();
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore]
async fn runtime_throw_is_classified() {
    let (pool, token) = start_pool(RunOptions::default()).await;

    let (status, payload) = run_script(&pool, "undefinedFunction();").await;
    assert_eq!(status, TaskStatus::Fail);
    assert_eq!(payload["error"], "SCRIPT_RUNTIME_ERROR");
    assert!(payload["log"]
        .as_str()
        .is_some_and(|s| s.contains("undefinedFunction")));

    token.cancel();
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore]
async fn syntax_error_settles_without_a_session() {
    let (pool, token) = start_pool(RunOptions::default()).await;

    let (status, payload) = run_script(&pool, "const a = ;").await;
    assert_eq!(status, TaskStatus::Fail);
    assert_eq!(payload["error"], "SCRIPT_SYNTAX_ERROR");
    assert_eq!(pool.active_count(), 0);

    token.cancel();
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore]
async fn deadline_abandons_the_script() {
    let run = RunOptions {
        max_task_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let (pool, token) = start_pool(run).await;

    let (status, payload) =
        run_script(&pool, "await new Promise(() => {}); resolve({});").await;
    assert_eq!(status, TaskStatus::Fail);
    assert_eq!(payload["error"], "TIMEOUT");
    assert_eq!(pool.stats().timed_out(), 1);

    token.cancel();
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore]
async fn ceiling_limits_concurrent_sessions() {
    // Ceiling of one regardless of cpu count.
    let run = RunOptions {
        workers_per_cpu: 0.000001,
        ..Default::default()
    };
    let (pool, token) = start_pool(run).await;
    assert_eq!(pool.max_workers(), 1);

    let (tx, rx) = oneshot::channel();
    pool.add_task(
        "await new Promise((r) => setTimeout(r, 500)); resolve({ first: true });",
        Box::new(move |status, _, _| {
            let _ = tx.send(status);
        }),
        None,
    );
    let (tx2, rx2) = oneshot::channel();
    pool.add_task(
        "resolve({ second: true });",
        Box::new(move |status, _, _| {
            let _ = tx2.send(status);
        }),
        None,
    );

    // While the first task sleeps, the second must stay queued.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pool.active_count(), 1);
    assert_eq!(pool.queue_length(), 1);

    assert_eq!(rx.await.unwrap(), TaskStatus::Done);
    assert_eq!(rx2.await.unwrap(), TaskStatus::Done);

    token.cancel();
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore]
async fn page_helpers_are_in_scope() {
    let (pool, token) = start_pool(RunOptions::default()).await;

    let (status, payload) = run_script(
        &pool,
        "resolve({ href: modules.URL.resolve('https://example.com/a/', 'b') });",
    )
    .await;
    assert_eq!(status, TaskStatus::Done);
    assert_eq!(payload["href"], "https://example.com/a/b");

    token.cancel();
    pool.close().await;
}
