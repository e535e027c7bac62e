use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kreact_core::bodies::Body;
use kreact_core::resources::Resource;
use kreact_daemons::{
    match_daemons, spawn_daemons, stop_all_daemons, stop_daemons, DaemonEnv, DaemonSettings, DaemonsMemory,
    StopReason, Termination,
};
use kreact_execution::{
    ErrorsMode, HandlerContext, HandlerError, HandlerFn, HandlerOptions, Indices, Memo, SpawningHandler,
};
use kreact_kubehub::MockClient;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn env(client: Arc<MockClient>, body: Body) -> DaemonEnv {
    DaemonEnv {
        resource: Resource::new("kopf.dev", "v1", "kopfexamples", "KopfExample", true),
        client,
        body,
        memo: Memo::default(),
        indices: Indices::new(),
        default_errors: ErrorsMode::Temporary,
    }
}

fn body() -> Body {
    Body::new(json!({"metadata": {"name": "ex", "namespace": "ns", "uid": "u1"}}))
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

fn until_stopped() -> HandlerFn {
    HandlerFn::new(|ctx: HandlerContext| async move {
        if let Some(stopper) = &ctx.stopper {
            stopper.wait().await;
        }
        Ok(None)
    })
}

#[tokio::test(start_paused = true)]
async fn cooperative_daemons_exit_without_any_waiting() {
    let memory = DaemonsMemory::new();
    let handler = SpawningHandler::daemon("d", until_stopped())
        .cancellation(Some(Duration::from_secs(10)), Some(Duration::from_secs(10)));
    spawn_daemons(&memory, [&handler], &env(Arc::new(MockClient::new()), body()));
    settle().await;
    assert_eq!(memory.running_ids(), vec!["d"]);

    let t0 = Instant::now();
    let delays = stop_daemons(&memory, StopReason::Deletion, &DaemonSettings::default()).await;
    assert!(delays.is_empty());
    assert_eq!(t0.elapsed(), Duration::ZERO);
    assert!(memory.is_empty());
    // Stopped from outside: it may run again later.
    assert!(!memory.is_forever_stopped("d"));
}

#[tokio::test]
async fn stubborn_blocking_daemons_are_abandoned() {
    let memory = DaemonsMemory::new();
    let handler = SpawningHandler::daemon(
        "stubborn",
        HandlerFn::blocking(|_ctx| {
            let t = std::time::Instant::now();
            while t.elapsed() < Duration::from_millis(400) {
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(None)
        }),
    )
    .cancellation(None, Some(Duration::from_millis(50)));
    spawn_daemons(&memory, [&handler], &env(Arc::new(MockClient::new()), body()));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let t0 = std::time::Instant::now();
    let report = stop_all_daemons([memory.clone()], &DaemonSettings::default(), &CancellationToken::new()).await;
    assert_eq!(report, vec![("stubborn".to_string(), Termination::Abandoned)]);
    assert!(t0.elapsed() < Duration::from_millis(300));
    assert!(memory.is_empty());
}

#[tokio::test(start_paused = true)]
async fn daemons_that_exit_on_their_own_are_not_respawned() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = calls.clone();
        SpawningHandler::daemon(
            "once",
            HandlerFn::new(move |_ctx| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            }),
        )
    };
    let memory = DaemonsMemory::new();
    let env = env(Arc::new(MockClient::new()), body());
    spawn_daemons(&memory, [&handler], &env);
    settle().await;
    assert!(memory.is_empty());
    assert!(memory.is_forever_stopped("once"));

    spawn_daemons(&memory, [&handler], &env);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn mismatching_daemons_are_stopped() {
    let memory = DaemonsMemory::new();
    let a = SpawningHandler::daemon("a", until_stopped());
    let b = SpawningHandler::daemon("b", until_stopped());
    spawn_daemons(&memory, [&a, &b], &env(Arc::new(MockClient::new()), body()));
    settle().await;

    let delays = match_daemons(&memory, &[&a], &DaemonSettings::default()).await;
    assert!(delays.is_empty());
    assert_eq!(memory.running_ids(), vec!["a"]);
}

#[tokio::test(start_paused = true)]
async fn sharp_timers_fire_on_the_grid() {
    let ticks = Arc::new(Mutex::new(Vec::new()));
    let start = Instant::now();
    let handler = {
        let ticks = ticks.clone();
        SpawningHandler::timer(
            "tick",
            Duration::from_secs(5),
            HandlerFn::new(move |_ctx| {
                let ticks = ticks.clone();
                async move {
                    ticks.lock().unwrap().push(start.elapsed().as_millis());
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(None)
                }
            }),
        )
        .sharp()
    };
    let memory = DaemonsMemory::new();
    spawn_daemons(&memory, [&handler], &env(Arc::new(MockClient::new()), body()));
    tokio::time::sleep(Duration::from_millis(16_000)).await;
    stop_daemons(&memory, StopReason::OperatorExiting, &DaemonSettings::default()).await;
    assert_eq!(*ticks.lock().unwrap(), vec![0, 5_000, 10_000, 15_000]);
}

#[tokio::test(start_paused = true)]
async fn idle_timers_wait_for_quiet_objects() {
    let ticks = Arc::new(Mutex::new(Vec::new()));
    let start = Instant::now();
    let handler = {
        let ticks = ticks.clone();
        SpawningHandler::timer(
            "quiet",
            Duration::from_secs(60),
            HandlerFn::new(move |_ctx| {
                let ticks = ticks.clone();
                async move {
                    ticks.lock().unwrap().push(start.elapsed().as_secs());
                    Ok(None)
                }
            }),
        )
        .idle(Duration::from_secs(3))
    };
    let memory = DaemonsMemory::new();
    spawn_daemons(&memory, [&handler], &env(Arc::new(MockClient::new()), body()));
    tokio::time::sleep(Duration::from_secs(2)).await;
    memory.touch();
    tokio::time::sleep(Duration::from_secs(4)).await;
    stop_daemons(&memory, StopReason::OperatorExiting, &DaemonSettings::default()).await;
    assert_eq!(*ticks.lock().unwrap(), vec![5]);
}

#[tokio::test(start_paused = true)]
async fn daemon_patches_reach_the_cluster() {
    let client = Arc::new(MockClient::new());
    let obj = client.insert(json!({"metadata": {"name": "ex", "namespace": "ns"}}));
    let handler = SpawningHandler::daemon(
        "writer",
        HandlerFn::new(|ctx: HandlerContext| async move {
            ctx.patch(|p| p.set(&["status", "seen"], json!(true)));
            Ok(None)
        }),
    );
    let memory = DaemonsMemory::new();
    spawn_daemons(&memory, [&handler], &env(client.clone(), Body::new(obj)));
    settle().await;
    assert!(memory.is_empty());
    assert_eq!(client.get(Some("ns"), "ex").unwrap()["status"]["seen"], json!(true));
}

#[tokio::test(start_paused = true)]
async fn daemons_finishing_their_cleanup_within_the_backoff_exit() {
    let memory = DaemonsMemory::new();
    let handler = SpawningHandler::daemon(
        "tidy",
        HandlerFn::new(|ctx: HandlerContext| async move {
            if let Some(stopper) = &ctx.stopper {
                stopper.wait().await;
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(None)
        }),
    )
    .cancellation(Some(Duration::from_secs(5)), Some(Duration::from_secs(5)));
    spawn_daemons(&memory, [&handler], &env(Arc::new(MockClient::new()), body()));
    settle().await;

    let t0 = Instant::now();
    let report = stop_all_daemons([memory.clone()], &DaemonSettings::default(), &CancellationToken::new()).await;
    assert_eq!(report, vec![("tidy".to_string(), Termination::Exited)]);
    assert!(t0.elapsed() >= Duration::from_secs(2));
    assert!(t0.elapsed() < Duration::from_secs(5));
    assert!(memory.is_empty());
}

#[tokio::test(start_paused = true)]
async fn deaf_daemons_are_cancelled_after_the_backoff() {
    let memory = DaemonsMemory::new();
    let handler = SpawningHandler::daemon(
        "deaf",
        HandlerFn::new(|_ctx| async {
            std::future::pending::<()>().await;
            Ok(None)
        }),
    )
    .cancellation(Some(Duration::from_secs(1)), Some(Duration::from_secs(5)));
    spawn_daemons(&memory, [&handler], &env(Arc::new(MockClient::new()), body()));
    settle().await;

    let t0 = Instant::now();
    let report = stop_all_daemons([memory.clone()], &DaemonSettings::default(), &CancellationToken::new()).await;
    assert_eq!(report, vec![("deaf".to_string(), Termination::Cancelled)]);
    assert!(t0.elapsed() >= Duration::from_secs(1));
    assert!(t0.elapsed() < Duration::from_secs(6));
    assert!(memory.is_empty());
}

#[tokio::test(start_paused = true)]
async fn undelayed_temporary_errors_back_off_between_runs() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = calls.clone();
        SpawningHandler::daemon(
            "flaky",
            HandlerFn::new(move |_ctx| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::Temporary { message: "not yet".into(), delay: None })
                }
            }),
        )
        .backoff(Duration::from_secs(10))
    };
    let memory = DaemonsMemory::new();
    spawn_daemons(&memory, [&handler], &env(Arc::new(MockClient::new()), body()));
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    stop_daemons(&memory, StopReason::OperatorExiting, &DaemonSettings::default()).await;
}
