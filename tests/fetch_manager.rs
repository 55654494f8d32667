//! End-to-end behaviour of the fetch manager against a mock origin.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use media_fetch::{
    DownloadState, Ensured, FetchConfig, FetchError, FetchEvent, FetchManager, ReachabilityFlag,
    TokioFileSystem,
};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn config(server: &MockServer, dir: &TempDir) -> FetchConfig {
    FetchConfig::new(server.uri(), dir.path())
        .with_batch_stagger(Duration::ZERO)
        .with_retry_base_delay(Duration::from_millis(10))
}

async fn serve(server: &MockServer, route: &str, content: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content))
        .mount(server)
        .await;
}

async fn serve_slowly(server: &MockServer, route: &str, delay: Duration) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body(64))
                .set_delay(delay),
        )
        .mount(server)
        .await;
}

fn pending(ensured: Ensured) -> media_fetch::Completion {
    match ensured {
        Ensured::Pending(completion) => completion,
        other => panic!("expected a pending transfer, got {other:?}"),
    }
}

#[tokio::test]
async fn fresh_file_is_not_downloaded_again() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("intro.mp4"), body(100)).unwrap();

    Mock::given(method("HEAD"))
        .and(path("/intro.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body(100)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let manager = FetchManager::new(config(&server, &dir)).unwrap();
    let ensured = manager.ensure_file("intro.mp4").await.unwrap();

    assert!(ensured.is_fresh());
    assert!(!manager.is_downloading("intro.mp4"));
    server.verify().await;
}

#[tokio::test]
async fn size_mismatch_triggers_redownload() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let final_path = dir.path().join("intro.mp4");
    std::fs::write(&final_path, body(100)).unwrap();

    // No Last-Modified: size alone decides.
    Mock::given(method("HEAD"))
        .and(path("/intro.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body(150)))
        .mount(&server)
        .await;
    serve(&server, "/intro.mp4", body(150)).await;

    let manager = FetchManager::new(config(&server, &dir)).unwrap();
    let done = pending(manager.ensure_file("intro.mp4").await.unwrap());
    let path = done.wait().await.unwrap();

    assert_eq!(path, final_path);
    assert_eq!(std::fs::read(&final_path).unwrap(), body(150));
}

#[tokio::test]
async fn resumes_partial_temp_file() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let full = body(100);
    std::fs::create_dir_all(dir.path().join("music")).unwrap();
    std::fs::write(dir.path().join("music/theme.ogg.temp"), &full[..40]).unwrap();

    Mock::given(method("GET"))
        .and(path("/music/theme.ogg"))
        .and(header("range", "bytes=40-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", "bytes 40-99/100")
                .set_body_bytes(full[40..].to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let manager = FetchManager::new(config(&server, &dir)).unwrap();
    let done = pending(manager.ensure_file("music/theme.ogg").await.unwrap());
    let path = done.wait().await.unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), full);
    assert!(!dir.path().join("music/theme.ogg.temp").exists());
    server.verify().await;
}

#[tokio::test]
async fn concurrency_cap_bounds_active_transfers() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let keys = ["a.mp4", "b.mp4", "c.mp4", "d.mp4", "e.mp4"];
    for key in keys {
        serve_slowly(&server, &format!("/{key}"), Duration::from_millis(150)).await;
    }

    let manager = FetchManager::new(config(&server, &dir).with_concurrency_cap(2)).unwrap();
    let mut completions = Vec::new();
    for key in keys {
        completions.push(pending(manager.ensure_file(key).await.unwrap()));
    }
    assert_eq!(manager.active_count(), 2);
    assert_eq!(manager.queued_count(), 3);
    assert_eq!(manager.state("e.mp4"), Some(DownloadState::Queued));

    let watcher = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut peak = 0;
            while keys.iter().any(|k| manager.is_downloading(k)) {
                peak = peak.max(manager.active_count());
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            peak
        })
    };

    for done in completions {
        done.wait().await.unwrap();
    }
    let peak = watcher.await.unwrap();

    assert!(peak <= 2, "peak of {peak} active transfers");
    assert_eq!(manager.active_count(), 0);
    assert_eq!(manager.queued_count(), 0);
    for key in keys {
        assert!(dir.path().join(key).exists());
    }
}

#[tokio::test]
async fn batch_reports_progress_then_completes() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let keys = ["scenes/one.mp4", "scenes/two.mp4", "music/three.ogg"];
    for key in keys {
        serve(&server, &format!("/{key}"), body(32)).await;
    }

    let manager = FetchManager::new(config(&server, &dir)).unwrap();
    let mut batch = manager.ensure_files(keys).unwrap();
    assert_eq!(batch.total(), 3);

    let mut seen = Vec::new();
    while let Some(update) = batch.next_progress().await {
        seen.push((update.completed, update.total));
    }
    assert_eq!(seen, vec![(1, 3), (2, 3), (3, 3)]);
    assert_eq!(batch.wait().await, Ok(()));
    for key in keys {
        assert!(dir.path().join(key).exists());
    }
}

#[tokio::test]
async fn batch_failure_names_first_failed_key() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    serve(&server, "/ok.mp4", body(16)).await;
    // Unmatched routes answer 404.

    let manager = FetchManager::new(config(&server, &dir)).unwrap();
    let batch = manager.ensure_files(["ok.mp4", "missing.mp4"]).unwrap();

    assert_eq!(
        batch.wait().await,
        Err(FetchError::BatchPartialFailure {
            key: "missing.mp4".to_string(),
            source: Box::new(FetchError::UnexpectedStatus(404)),
        })
    );
    assert!(!dir.path().join("missing.mp4.temp").exists());
}

#[tokio::test]
async fn cancelling_active_transfer_keeps_partial_file() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let temp = dir.path().join("slow.mp4.temp");
    std::fs::write(&temp, body(10)).unwrap();
    serve_slowly(&server, "/slow.mp4", Duration::from_secs(5)).await;

    let manager = FetchManager::new(config(&server, &dir)).unwrap();
    let done = pending(manager.ensure_file("slow.mp4").await.unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(manager.cancel_download("slow.mp4"));
    assert_eq!(done.wait().await, Err(FetchError::Cancelled));
    assert!(!manager.is_downloading("slow.mp4"));
    assert_eq!(manager.active_count(), 0);
    assert_eq!(std::fs::read(&temp).unwrap(), body(10));
    assert!(!dir.path().join("slow.mp4").exists());
}

#[tokio::test]
async fn cancelling_queued_request_resolves_at_once() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    serve_slowly(&server, "/first.mp4", Duration::from_secs(5)).await;
    serve_slowly(&server, "/second.mp4", Duration::from_secs(5)).await;

    let manager = FetchManager::new(config(&server, &dir).with_concurrency_cap(1)).unwrap();
    let first = pending(manager.ensure_file("first.mp4").await.unwrap());
    let second = pending(manager.ensure_file("second.mp4").await.unwrap());
    assert_eq!(manager.queued_count(), 1);

    assert!(manager.cancel_download("second.mp4"));
    assert_eq!(second.wait().await, Err(FetchError::Cancelled));
    assert_eq!(manager.queued_count(), 0);
    assert!(manager.is_downloading("first.mp4"));

    assert!(manager.cancel_download("first.mp4"));
    assert_eq!(first.wait().await, Err(FetchError::Cancelled));
}

#[tokio::test]
async fn duplicate_request_can_watch_the_original() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    serve_slowly(&server, "/shared.mp4", Duration::from_millis(100)).await;

    let manager = FetchManager::new(config(&server, &dir)).unwrap();
    let original = pending(manager.ensure_file("shared.mp4").await.unwrap());
    assert!(matches!(
        manager.ensure_file("shared.mp4").await.unwrap(),
        Ensured::InFlight
    ));
    let observer = manager.watch("shared.mp4").unwrap();

    let a = original.wait().await.unwrap();
    let b = observer.wait().await.unwrap();
    assert_eq!(a, b);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn key_stream_reports_lifecycle() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    serve(&server, "/clip.mp4", body(4096)).await;

    let manager = FetchManager::new(config(&server, &dir)).unwrap();
    let mut events = manager.progress_stream("clip.mp4");
    let done = pending(manager.ensure_file("clip.mp4").await.unwrap());
    done.wait().await.unwrap();

    let mut states = Vec::new();
    let mut last_fraction = None;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap();
        match event {
            FetchEvent::StateChanged { state, .. } => states.push(state),
            FetchEvent::Progress { fraction, .. } => last_fraction = Some(fraction),
            FetchEvent::Complete { key } => {
                assert_eq!(key, "clip.mp4");
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    assert_eq!(
        states,
        vec![
            DownloadState::Queued,
            DownloadState::Transferring,
            DownloadState::Succeeded
        ]
    );
    assert_eq!(last_fraction, Some(1.0));
}

#[tokio::test]
async fn newer_remote_version_triggers_redownload() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let final_path = dir.path().join("intro.mp4");
    std::fs::write(&final_path, body(100)).unwrap();

    // Same size, but published long after the local copy was written.
    Mock::given(method("HEAD"))
        .and(path("/intro.mp4"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("last-modified", "Wed, 21 Oct 2099 07:28:00 GMT")
                .set_body_bytes(body(100)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/intro.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7; 100]))
        .expect(1)
        .mount(&server)
        .await;

    let manager = FetchManager::new(config(&server, &dir)).unwrap();
    let done = pending(manager.ensure_file("intro.mp4").await.unwrap());
    done.wait().await.unwrap();

    assert_eq!(std::fs::read(&final_path).unwrap(), vec![7; 100]);
    server.verify().await;
}

#[tokio::test]
async fn unreachable_origin_keeps_present_file() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("intro.mp4"), body(100)).unwrap();

    // Nothing listens on the discard port.
    let config = FetchConfig::new("http://127.0.0.1:9", dir.path());
    let manager = FetchManager::new(config).unwrap();
    let ensured = manager.ensure_file("intro.mp4").await.unwrap();

    assert!(ensured.is_fresh());
    assert_eq!(std::fs::read(dir.path().join("intro.mp4")).unwrap(), body(100));
}

#[tokio::test]
async fn offline_request_fails_without_queueing() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    serve_slowly(&server, "/first.mp4", Duration::from_secs(5)).await;
    serve(&server, "/second.mp4", body(16)).await;

    let flag = Arc::new(ReachabilityFlag::new(true));
    let manager = FetchManager::with_parts(
        config(&server, &dir).with_concurrency_cap(1),
        reqwest::Client::new(),
        Arc::new(TokioFileSystem),
        flag.clone(),
    )
    .unwrap();
    let first = pending(manager.ensure_file("first.mp4").await.unwrap());
    assert_eq!(manager.active_count(), 1);

    flag.set_online(false);
    let mut events = manager.progress_stream("second.mp4");
    let second = pending(manager.ensure_file("second.mp4").await.unwrap());
    assert_eq!(manager.queued_count(), 0);
    assert!(!manager.is_downloading("second.mp4"));

    let outcome = tokio::time::timeout(Duration::from_millis(500), second.wait())
        .await
        .unwrap();
    assert_eq!(outcome, Err(FetchError::NetworkUnavailable));
    assert!(!dir.path().join("second.mp4.temp").exists());

    let failed = loop {
        match events.next().await.unwrap() {
            FetchEvent::Error { message, .. } => break message,
            FetchEvent::StateChanged { state, .. } => assert_eq!(state, DownloadState::Failed),
            other => panic!("unexpected event {other:?}"),
        }
    };
    assert_eq!(failed, FetchError::NetworkUnavailable.to_string());

    assert!(manager.cancel_download("first.mp4"));
    assert_eq!(first.wait().await, Err(FetchError::Cancelled));
}

#[tokio::test]
async fn offline_present_file_is_used_without_asking_the_origin() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("intro.mp4"), body(100)).unwrap();
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body(150)))
        .expect(0)
        .mount(&server)
        .await;

    let manager = FetchManager::with_parts(
        config(&server, &dir),
        reqwest::Client::new(),
        Arc::new(TokioFileSystem),
        Arc::new(ReachabilityFlag::new(false)),
    )
    .unwrap();

    assert!(manager.ensure_file("intro.mp4").await.unwrap().is_fresh());
    server.verify().await;
}

#[tokio::test]
async fn state_is_cleared_once_resolved() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    serve_slowly(&server, "/clip.mp4", Duration::from_millis(100)).await;

    let manager = FetchManager::new(config(&server, &dir)).unwrap();
    let done = pending(manager.ensure_file("clip.mp4").await.unwrap());
    assert!(manager.state("clip.mp4").is_some());

    done.wait().await.unwrap();
    assert_eq!(manager.state("clip.mp4"), None);
    assert!(!manager.is_downloading("clip.mp4"));
}

#[tokio::test]
async fn batch_failure_can_cancel_started_siblings() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let temp = dir.path().join("slow.mp4.temp");
    std::fs::write(&temp, body(10)).unwrap();
    serve_slowly(&server, "/slow.mp4", Duration::from_secs(5)).await;

    let manager =
        FetchManager::new(config(&server, &dir).with_cancel_batch_on_failure(true)).unwrap();
    let mut events = manager.progress_stream("slow.mp4");
    let batch = manager.ensure_files(["slow.mp4", "missing.mp4"]).unwrap();

    assert_eq!(
        batch.wait().await,
        Err(FetchError::BatchPartialFailure {
            key: "missing.mp4".to_string(),
            source: Box::new(FetchError::UnexpectedStatus(404)),
        })
    );

    let cancelled = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(event) = events.next().await {
            if matches!(event, FetchEvent::Cancelled { .. }) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(cancelled);
    assert!(!manager.is_downloading("slow.mp4"));
    assert_eq!(std::fs::read(&temp).unwrap(), body(10));
    assert!(!dir.path().join("slow.mp4").exists());
}

#[tokio::test]
async fn staggered_batch_completes() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let keys = ["one.mp4", "two.mp4", "three.mp4"];
    for key in keys {
        serve(&server, &format!("/{key}"), body(32)).await;
    }

    let manager = FetchManager::new(
        config(&server, &dir).with_batch_stagger(Duration::from_millis(30)),
    )
    .unwrap();
    let started = std::time::Instant::now();
    let mut batch = manager.ensure_files(keys).unwrap();

    let mut seen = Vec::new();
    while let Some(update) = batch.next_progress().await {
        seen.push(update.completed);
    }
    assert_eq!(seen, vec![1, 2, 3]);
    assert_eq!(batch.wait().await, Ok(()));
    assert!(started.elapsed() >= Duration::from_millis(60));
    for key in keys {
        assert!(dir.path().join(key).exists());
    }
}
