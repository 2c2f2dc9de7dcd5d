//! Worker pool supervision.
//!
//! Workers are tokio tasks. The supervisor respawns a worker that
//! exits or panics, up to a per-slot restart cap, runs the periodic
//! stale-claim sweep, and on shutdown signals all workers, waits a
//! grace period, aborts stragglers, and releases any rows this
//! instance still holds claimed.

use retouch_backup::BackupStore;
use retouch_config::PoolConfig;
use retouch_core::notify::Notifier;
use retouch_core::transform::Transformer;
use retouch_core::ResourceId;
use retouch_db::repo::{ContentStore, JobStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{error, info, warn};

use crate::claim::Claimer;
use crate::pipeline::Pipeline;
use crate::worker::Worker;

const HEALTH_INTERVAL: Duration = Duration::from_secs(60);

enum PoolEvent {
    Exited { slot: usize, panicked: bool },
    Respawn { slot: usize },
}

struct Slot {
    abort: Option<AbortHandle>,
    started_at: Option<Instant>,
    restarts: u32,
}

pub struct WorkerPool {
    jobs: Arc<dyn JobStore>,
    contents: Arc<dyn ContentStore>,
    pipeline: Arc<Pipeline>,
    config: PoolConfig,
    /// Per-process prefix for worker ids; `claimed_by` rows carrying it
    /// belong to this instance.
    instance: String,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn JobStore>,
        contents: Arc<dyn ContentStore>,
        backups: Arc<BackupStore>,
        transformer: Arc<dyn Transformer>,
        notifier: Arc<dyn Notifier>,
        config: PoolConfig,
        transform_timeout: Duration,
    ) -> Self {
        let pipeline = Arc::new(Pipeline::new(
            jobs.clone(),
            contents.clone(),
            backups,
            transformer,
            notifier,
            transform_timeout,
        ));
        Self {
            jobs,
            contents,
            pipeline,
            config,
            instance: format!("agent-{}", ResourceId::new().short()),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Run the pool until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let (worker_shutdown_tx, _) = watch::channel(false);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<PoolEvent>();

        let mut slots: Vec<Slot> = (0..self.config.workers)
            .map(|_| Slot {
                abort: None,
                started_at: None,
                restarts: 0,
            })
            .collect();
        for slot in 0..slots.len() {
            slots[slot].abort =
                Some(self.spawn_worker(slot, &worker_shutdown_tx, &event_tx));
            slots[slot].started_at = Some(Instant::now());
        }
        info!(
            instance = %self.instance,
            workers = slots.len(),
            "worker pool started"
        );

        let mut health = tokio::time::interval(HEALTH_INTERVAL);
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Sweep often enough that a stale claim is never held much
        // longer than the configured age.
        let sweep_period = self
            .config
            .stale_claim_after
            .map(|age| age.min(HEALTH_INTERVAL))
            .unwrap_or(HEALTH_INTERVAL);
        let mut sweep = tokio::time::interval(sweep_period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender means nobody can signal us
                    // anymore; treat it as shutdown rather than
                    // re-polling a closed channel forever.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(event) = event_rx.recv() => match event {
                    PoolEvent::Exited { slot, panicked } => {
                        self.on_worker_exit(&mut slots, slot, panicked, &event_tx);
                    }
                    PoolEvent::Respawn { slot } => {
                        slots[slot].abort =
                            Some(self.spawn_worker(slot, &worker_shutdown_tx, &event_tx));
                        slots[slot].started_at = Some(Instant::now());
                    }
                },
                _ = health.tick() => self.log_health(&slots),
                _ = sweep.tick() => {
                    if let Some(age) = self.config.stale_claim_after {
                        match self.jobs.release_stale(age).await {
                            Ok(0) => {}
                            Ok(released) => {
                                warn!(released, "reclaimed stale processing rows")
                            }
                            Err(e) => warn!(error = %e, "stale-claim sweep failed"),
                        }
                    }
                }
            }
        }

        self.shutdown_workers(&worker_shutdown_tx, &mut slots, &mut event_rx)
            .await;
    }

    fn spawn_worker(
        &self,
        slot: usize,
        worker_shutdown: &watch::Sender<bool>,
        event_tx: &mpsc::UnboundedSender<PoolEvent>,
    ) -> AbortHandle {
        let worker_id = format!("{}-w{slot}", self.instance);
        let worker = Worker::new(
            worker_id,
            Claimer::new(self.jobs.clone(), self.contents.clone()),
            self.pipeline.clone(),
            self.jobs.clone(),
            self.config.poll_interval,
            self.config.max_consecutive_failures,
            worker_shutdown.subscribe(),
        );
        let handle = tokio::spawn(worker.run());
        let abort = handle.abort_handle();

        // Monitor task: the pool learns about worker exits, panics
        // included, through the event channel.
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            let panicked = handle.await.is_err();
            let _ = event_tx.send(PoolEvent::Exited { slot, panicked });
        });

        abort
    }

    fn on_worker_exit(
        &self,
        slots: &mut [Slot],
        slot: usize,
        panicked: bool,
        event_tx: &mpsc::UnboundedSender<PoolEvent>,
    ) {
        slots[slot].abort = None;
        if panicked {
            error!(instance = %self.instance, slot, "worker panicked");
        } else {
            warn!(instance = %self.instance, slot, "worker exited");
        }

        if slots[slot].restarts >= self.config.max_restarts {
            error!(
                instance = %self.instance,
                slot,
                restarts = slots[slot].restarts,
                "restart cap reached, slot stays down"
            );
            return;
        }
        slots[slot].restarts += 1;

        let delay = self.config.restart_delay;
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = event_tx.send(PoolEvent::Respawn { slot });
        });
    }

    fn log_health(&self, slots: &[Slot]) {
        let live = slots.iter().filter(|s| s.abort.is_some()).count();
        let restarts: u32 = slots.iter().map(|s| s.restarts).sum();
        let oldest_uptime = slots
            .iter()
            .filter(|s| s.abort.is_some())
            .filter_map(|s| s.started_at)
            .map(|t| t.elapsed().as_secs())
            .max()
            .unwrap_or(0);
        info!(
            instance = %self.instance,
            live,
            total = slots.len(),
            restarts,
            oldest_uptime_secs = oldest_uptime,
            "pool health"
        );
    }

    /// Signal workers, wait out the grace period, abort stragglers,
    /// and release any rows still claimed by this instance.
    async fn shutdown_workers(
        &self,
        worker_shutdown: &watch::Sender<bool>,
        slots: &mut [Slot],
        event_rx: &mut mpsc::UnboundedReceiver<PoolEvent>,
    ) {
        info!(instance = %self.instance, "shutting down worker pool");
        let _ = worker_shutdown.send(true);

        let deadline = Instant::now() + self.config.shutdown_grace;
        while slots.iter().any(|s| s.abort.is_some()) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, event_rx.recv()).await {
                Ok(Some(PoolEvent::Exited { slot, .. })) => slots[slot].abort = None,
                Ok(Some(PoolEvent::Respawn { .. })) => {}
                Ok(None) | Err(_) => break,
            }
        }

        let mut aborted = 0;
        for slot in slots.iter_mut() {
            if let Some(abort) = slot.abort.take() {
                abort.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(instance = %self.instance, aborted, "aborted workers past grace period");
        }

        match self
            .jobs
            .release_claimed_by(&format!("{}-", self.instance))
            .await
        {
            Ok(released) => {
                info!(
                    instance = %self.instance,
                    released,
                    "worker pool stopped"
                );
            }
            Err(e) => {
                // Rows stay processing; the stale-claim sweep of the
                // next instance recovers them.
                error!(instance = %self.instance, error = %e, "failed to release claimed rows");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use retouch_core::content::{Content, Revision};
    use retouch_core::notify::NoopNotifier;
    use retouch_core::request::NewEditRequest;
    use retouch_core::transform::{TransformError, TransformOutput};
    use retouch_db::memory::MemoryStore;
    use retouch_db::{DbError, DbResult};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn valid_page(marker: &str) -> String {
        format!(
            "<!DOCTYPE html><html><head>\
             <meta name=\"viewport\" content=\"width=device-width\">\
             </head><body><div>{marker}</div></body></html>"
        )
    }

    struct InstantTransformer;

    #[async_trait]
    impl Transformer for InstantTransformer {
        fn name(&self) -> &'static str {
            "instant"
        }

        async fn transform(
            &self,
            _instruction: &str,
            _payload: &str,
            _timeout: Duration,
        ) -> Result<TransformOutput, TransformError> {
            Ok(TransformOutput {
                payload: valid_page("edited"),
            })
        }
    }

    /// Never completes; used to simulate a wedged tool.
    struct HangingTransformer;

    #[async_trait]
    impl Transformer for HangingTransformer {
        fn name(&self) -> &'static str {
            "hanging"
        }

        async fn transform(
            &self,
            _instruction: &str,
            _payload: &str,
            _timeout: Duration,
        ) -> Result<TransformOutput, TransformError> {
            std::future::pending().await
        }
    }

    fn test_config(workers: usize, stale_claim_after: Option<Duration>) -> PoolConfig {
        PoolConfig {
            workers,
            poll_interval: Duration::from_millis(5),
            max_consecutive_failures: 5,
            restart_delay: Duration::from_millis(10),
            max_restarts: 3,
            shutdown_grace: Duration::from_millis(100),
            stale_claim_after,
        }
    }

    fn pool(
        store: &Arc<MemoryStore>,
        transformer: Arc<dyn Transformer>,
        config: PoolConfig,
    ) -> WorkerPool {
        let backups = Arc::new(BackupStore::new(
            std::env::temp_dir()
                .join("retouch-pool-tests")
                .join(uuid::Uuid::now_v7().simple().to_string()),
        ));
        WorkerPool::new(
            store.clone(),
            store.clone(),
            backups,
            transformer,
            Arc::new(NoopNotifier),
            config,
            Duration::from_secs(5),
        )
    }

    async fn submit(store: &MemoryStore, content_id: uuid::Uuid) -> uuid::Uuid {
        store
            .insert(NewEditRequest {
                content_id,
                instruction: "edit".to_string(),
                requester: None,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_pool_drains_queue_across_workers() {
        let store = Arc::new(MemoryStore::new());
        let mut ids = Vec::new();
        for n in 0..3 {
            let c = uuid::Uuid::now_v7();
            store
                .insert_content(c, &valid_page(&format!("v{n}")))
                .await
                .unwrap();
            ids.push(submit(&store, c).await);
        }

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(pool(&store, Arc::new(InstantTransformer), test_config(2, None)).run(rx));

        for id in &ids {
            for attempt in 0..200 {
                if store.get(*id).await.unwrap().status == "completed" {
                    break;
                }
                assert!(attempt < 199, "request {id} never completed");
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_claims_held_by_hung_workers() {
        let store = Arc::new(MemoryStore::new());
        let c = uuid::Uuid::now_v7();
        store.insert_content(c, &valid_page("v1")).await.unwrap();
        let id = submit(&store, c).await;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(pool(&store, Arc::new(HangingTransformer), test_config(1, None)).run(rx));

        // Wait for the worker to claim the row, then shut down.
        for _ in 0..200 {
            if store.get(id).await.unwrap().status == "processing" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.get(id).await.unwrap().status, "processing");

        tx.send(true).unwrap();
        handle.await.unwrap();

        // The hung worker was aborted and its claim released.
        assert_eq!(store.get(id).await.unwrap().status, "pending");
    }

    #[tokio::test]
    async fn test_stale_claim_sweep_reclaims_abandoned_rows() {
        let store = Arc::new(MemoryStore::new());
        let c = uuid::Uuid::now_v7();
        store.insert_content(c, &valid_page("v1")).await.unwrap();
        let id = submit(&store, c).await;

        // Claim under a worker id outside this pool's prefix, as if an
        // earlier instance died holding it.
        assert!(store.try_claim(id, "dead-agent-w0").await.unwrap());
        store.backdate_claim(id, Duration::from_secs(3600));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(
            pool(
                &store,
                Arc::new(InstantTransformer),
                test_config(1, Some(Duration::from_millis(20))),
            )
            .run(rx),
        );

        // Swept back to pending, then processed normally.
        for _ in 0..200 {
            if store.get(id).await.unwrap().status == "completed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.get(id).await.unwrap().status, "completed");

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    /// ContentStore whose reads always fail, counting every attempt.
    struct BrokenContentStore {
        inner: Arc<MemoryStore>,
        reads: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ContentStore for BrokenContentStore {
        async fn insert_content(&self, id: uuid::Uuid, payload: &str) -> DbResult<Content> {
            self.inner.insert_content(id, payload).await
        }

        async fn get_content(&self, _id: uuid::Uuid) -> DbResult<Content> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Err(DbError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn get_revision(
            &self,
            content_id: uuid::Uuid,
            revision_id: i64,
        ) -> DbResult<Revision> {
            self.inner.get_revision(content_id, revision_id).await
        }

        async fn publish_revision(&self, content_id: uuid::Uuid, payload: &str) -> DbResult<i64> {
            self.inner.publish_revision(content_id, payload).await
        }

        async fn update_payload(&self, content_id: uuid::Uuid, payload: &str) -> DbResult<()> {
            self.inner.update_payload(content_id, payload).await
        }
    }

    #[tokio::test]
    async fn test_crashed_slot_respawns_until_restart_cap() {
        let store = Arc::new(MemoryStore::new());
        let c = uuid::Uuid::now_v7();
        store.insert_content(c, &valid_page("v1")).await.unwrap();
        submit(&store, c).await;

        let reads = Arc::new(AtomicU32::new(0));
        let contents = Arc::new(BrokenContentStore {
            inner: store.clone(),
            reads: reads.clone(),
        });

        // Each worker generation dies after one failed claim, so the
        // read counter counts generations: the initial spawn plus one
        // per allowed restart.
        let config = PoolConfig {
            workers: 1,
            poll_interval: Duration::from_millis(5),
            max_consecutive_failures: 1,
            restart_delay: Duration::from_millis(10),
            max_restarts: 2,
            shutdown_grace: Duration::from_millis(100),
            stale_claim_after: None,
        };
        let backups = Arc::new(BackupStore::new(
            std::env::temp_dir()
                .join("retouch-pool-tests")
                .join(uuid::Uuid::now_v7().simple().to_string()),
        ));
        let pool = WorkerPool::new(
            store.clone(),
            contents,
            backups,
            Arc::new(InstantTransformer),
            Arc::new(NoopNotifier),
            config,
            Duration::from_secs(5),
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(pool.run(rx));

        for _ in 0..200 {
            if reads.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(reads.load(Ordering::SeqCst), 3);

        // Well past several restart delays: the slot stays down.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(reads.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_pool_stops_when_shutdown_sender_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let p = pool(&store, Arc::new(InstantTransformer), test_config(1, None));

        let (tx, rx) = watch::channel(false);
        drop(tx);

        // A closed channel must stop the pool, not spin it.
        tokio::time::timeout(Duration::from_secs(5), p.run(rx))
            .await
            .expect("pool kept running after its shutdown channel closed");
    }
}
