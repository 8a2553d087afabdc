// End-to-end offline scan flow: queue while disconnected, reconnect,
// drain automatically, and watch the station state follow along.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use floorsync::{
    Headers, HttpResponse, HttpTransport, ManualClock, ManualConnectivity, MemorySnapshotStore,
    Method, OfflineQueue, QueueConfig, QueueError, ScannerStateManager, SqliteRequestStore,
    StateConfig, TransportError, UnixTimeMs,
};

/// Pops one canned outcome per call, in order.
struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    fn new(script: Vec<Result<HttpResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(
        &self,
        _method: Method,
        url: &str,
        _body: Option<&[u8]>,
        _headers: &Headers,
    ) -> Result<HttpResponse, TransportError> {
        self.calls.lock().await.push(url.to_string());
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Network("script exhausted".into())))
    }
}

fn ok() -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse {
        status: 200,
        body: b"{}".to_vec(),
    })
}

#[tokio::test]
async fn offline_scans_queue_then_drain_on_reconnect() {
    let connectivity = Arc::new(ManualConnectivity::new(false));
    let clock = Arc::new(ManualClock::new(UnixTimeMs(1_700_000_000_000)));
    let store = Arc::new(SqliteRequestStore::new_in_memory().await.unwrap());
    let transport = ScriptedTransport::new(vec![ok(), ok()]);

    let queue: Arc<OfflineQueue<Value>> = OfflineQueue::new(
        store,
        transport.clone(),
        connectivity.clone(),
        clock.clone(),
        QueueConfig::default(),
    )
    .unwrap();

    let manager: Arc<ScannerStateManager> = ScannerStateManager::new(
        Arc::new(MemorySnapshotStore::new()),
        connectivity.as_ref(),
        clock.clone(),
        StateConfig::default(),
    );
    manager.attach_queue(&queue);
    manager.set_current_operation("WO-1001", 20);

    // Two scans while the network is down. Both must come back as the
    // queued sentinel, and the station state must show the backlog.
    for lp in ["LP-0001", "LP-0002"] {
        clock.advance(1);
        manager.stage_lp(20, lp, json!({"qty": 1}));
        let err = queue
            .make_request(
                Method::Post,
                "https://erp.local/api/scanner/stage",
                Some(json!({"lp_id": lp, "operation_seq": 20})),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::OfflineQueued { .. }));
    }

    let state = manager.state();
    assert!(!state.is_online);
    assert_eq!(state.queue_length, 2);
    assert!(state.last_sync_time.is_none());
    assert_eq!(state.staged_lps.get(&20).map(Vec::len), Some(2));

    // Nothing went over the wire while offline.
    assert!(transport.calls.lock().await.is_empty());

    // Reconnect. The watcher drains in the background; poll the state
    // the way a UI would.
    connectivity.set_online(true);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let state = manager.state();
        if state.queue_length == 0 && state.is_online {
            assert!(state.last_sync_time.is_some());
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "queue never drained after reconnect"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(transport.calls.lock().await.len(), 2);

    // Staged LPs are workflow state, not queue state; draining leaves
    // them alone until the workflow confirms and unstages.
    assert_eq!(manager.staged_lps(20).len(), 2);

    queue.close();
    manager.destroy();
}

#[tokio::test]
async fn replay_failures_retry_and_eventually_drop() {
    // Starts online: queue_request persists without attempting, and no
    // connectivity edge fires a background drain under the test's feet.
    let connectivity = Arc::new(ManualConnectivity::new(true));
    let clock = Arc::new(ManualClock::new(UnixTimeMs(1)));
    let store = Arc::new(SqliteRequestStore::new_in_memory().await.unwrap());
    let transport = ScriptedTransport::new(vec![
        Err(TransportError::Network("down".into())),
        Err(TransportError::Network("down".into())),
        Err(TransportError::Network("still down".into())),
    ]);

    let queue: Arc<OfflineQueue<Value>> = OfflineQueue::new(
        store,
        transport.clone(),
        connectivity.clone(),
        clock,
        QueueConfig::default(),
    )
    .unwrap();

    queue
        .queue_request(Method::Put, "https://erp.local/api/scanner/consume", None, None)
        .await
        .unwrap();

    // Drive three explicit passes; the default budget is three attempts.
    let mut dropped = 0;
    for _ in 0..5 {
        let report = queue.process_queue().await.unwrap();
        dropped += report.dropped;
        if queue.status().await.unwrap().queue_length == 0 {
            break;
        }
    }

    assert_eq!(dropped, 1);
    assert_eq!(queue.status().await.unwrap().queue_length, 0);
    assert_eq!(transport.calls.lock().await.len(), 3);

    queue.close();
}
