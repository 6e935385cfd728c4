mod common;

use async_trait::async_trait;
use common::{drain_session, test_config, NullSink};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use voicebridge::{
    backend::mock::MockBackend,
    call::{CallManager, StreamStart, TelephonyInput, TelephonyStatus},
    config::SlotConfig,
    dialer::{DialRequest, DialScheduler, Dialer, Lead, RunStatus, SqliteDialStore},
    slots::{MemorySlotStore, SlotSemaphore},
    CallDirection,
};

/// Telephony vendor stand-in: every fifth lead is busy, the rest answer,
/// talk briefly and hang up.
struct VendorSim {
    calls: CallManager,
    dialed: AtomicUsize,
    live: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Dialer for VendorSim {
    async fn dial(&self, request: DialRequest) -> anyhow::Result<()> {
        let n = self.dialed.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);

        let calls = self.calls.clone();
        let live = self.live.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if n % 5 == 4 {
                live.fetch_sub(1, Ordering::SeqCst);
                calls
                    .on_status(&request.call_id, TelephonyStatus::Busy)
                    .await
                    .ok();
                return;
            }
            let handle = match calls.attach(StreamStart {
                call_id: request.call_id.clone(),
                tenant_id: request.tenant_id.clone(),
                direction: Some(CallDirection::Outbound),
                callee: Some(request.to.clone()),
                job_id: Some(request.job_id.clone()),
                ..Default::default()
            }) {
                Ok(handle) => handle,
                Err(_) => {
                    live.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            };
            let (media_tx, media_rx) = mpsc::channel(8);
            let runner = calls.clone();
            let run = tokio::spawn(async move { runner.run(handle, media_rx, NullSink).await });
            tokio::time::sleep(Duration::from_millis(30)).await;
            live.fetch_sub(1, Ordering::SeqCst);
            media_tx.send(TelephonyInput::Stop).await.ok();
            run.await.ok();
        });
        Ok(())
    }
}

#[tokio::test]
async fn test_bulk_run_respects_slot_bound() {
    let mut config = test_config();
    config.dialer.poll_interval_ms = 10;
    config.dialer.from_number = Some("+15550009999".to_string());
    let config = Arc::new(config);

    let (backend, controller) = MockBackend::new();
    tokio::spawn(async move {
        while let Some(session) = controller.next_session().await {
            drain_session(session);
        }
    });
    let calls = CallManager::new(config.clone(), Arc::new(backend));
    let slots = Arc::new(SlotSemaphore::new(
        Arc::new(MemorySlotStore::new()),
        SlotConfig {
            max_slots: 3,
            waiter_poll_ms: 10,
            ..Default::default()
        },
    ));
    let live = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let vendor = Arc::new(VendorSim {
        calls: calls.clone(),
        dialed: AtomicUsize::new(0),
        live: live.clone(),
        peak: peak.clone(),
    });
    let scheduler = Arc::new(DialScheduler::new(
        "worker-1".to_string(),
        config.dialer.clone(),
        Arc::new(SqliteDialStore::open(":memory:").unwrap()),
        slots.clone(),
        calls.clone(),
        vendor.clone(),
    ));
    let token = CancellationToken::new();
    tokio::spawn(scheduler.clone().serve(token.clone()));

    let leads: Vec<Lead> = (0..50)
        .map(|i| Lead {
            lead_id: Some(format!("lead-{}", i)),
            phone: format!("+1555010{:04}", i),
            name: None,
        })
        .collect();
    let created = scheduler.create_run("tenant-1", &leads).unwrap();

    let mut finished = None;
    for _ in 0..3000 {
        assert!(slots.holders("tenant-1").unwrap().len() <= 3);
        let (run, counts) = scheduler.run_summary(&created.run_id).unwrap().unwrap();
        if run.status == RunStatus::Completed {
            finished = Some((run, counts));
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let (run, counts) = finished.expect("run did not complete");

    assert_eq!(counts.completed + counts.failed + counts.cancelled, 50);
    assert_eq!(counts.failed, 10);
    assert_eq!(counts.completed, 40);
    assert_eq!(counts.in_flight(), 0);
    assert_eq!(run.cursor, 50);
    assert_eq!(vendor.dialed.load(Ordering::SeqCst), 50);
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 3, "peak concurrency {}", peak);
    assert!(slots.holders("tenant-1").unwrap().is_empty());
    assert_eq!(calls.registry().count(), 0);
    token.cancel();
}
