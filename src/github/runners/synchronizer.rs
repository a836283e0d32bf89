use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RunnerInstance, RunnerSnapshot};
use crate::config::RunnersConfig;
use crate::github::Target;
use crate::metrics::ManagerMetrics;
use crate::utils::broadcaster::Broadcaster;

/// Periodically pages all runners registered against the target and
/// publishes a complete snapshot per pass.
///
/// One page is fetched per tick. A transport failure aborts the tick
/// without touching the page cursor or the epoch, so a pass resumes
/// where it left off and a snapshot is only ever published whole.
pub struct Synchronizer {
    target: Arc<dyn Target>,
    sync_interval: Duration,
    page_size: u32,
    state: Arc<Broadcaster<Arc<RunnerSnapshot>>>,
    metrics: ManagerMetrics,
}

impl Synchronizer {
    pub fn new(config: &RunnersConfig, target: Arc<dyn Target>, metrics: ManagerMetrics) -> Self {
        Self {
            target,
            sync_interval: config.sync_interval(),
            page_size: config.sync_page_size(),
            state: Arc::new(Broadcaster::new(Arc::new(RunnerSnapshot::default()))),
            metrics,
        }
    }

    /// Handle for readers: the manager API and any snapshot subscriber.
    pub fn state(&self) -> Arc<Broadcaster<Arc<RunnerSnapshot>>> {
        Arc::clone(&self.state)
    }

    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut work = SyncWork::new(1, self.page_size);

        loop {
            if let Some(snapshot) = work.step(self.target.as_ref()).await {
                let next_epoch = snapshot.epoch + 1;
                self.metrics.observe_snapshot(&snapshot);
                self.state.publish(Arc::new(snapshot));
                work = SyncWork::new(next_epoch, self.page_size);
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = sleep(self.sync_interval) => {}
            }
        }
    }
}

struct SyncWork {
    epoch: i64,
    page: u32,
    page_size: u32,
    instances: HashMap<String, RunnerInstance>,
}

impl SyncWork {
    fn new(epoch: i64, page_size: u32) -> Self {
        Self {
            epoch,
            page: 1,
            page_size,
            instances: HashMap::new(),
        }
    }

    /// Fetches the next page. Returns the finished snapshot once the
    /// listing is exhausted, `None` while paging or on failure.
    async fn step(&mut self, target: &dyn Target) -> Option<RunnerSnapshot> {
        debug!(page = self.page, epoch = self.epoch, "fetching runner page");

        let (runners, next_page) = match target.get_runners(self.page, self.page_size).await {
            Ok(page) => page,
            Err(err) => {
                warn!(error = %err, page = self.page, "failed to get runners");
                return None;
            }
        };

        for runner in runners {
            let instance = RunnerInstance::from(runner);
            self.instances.insert(instance.name.clone(), instance);
        }

        if let Some(next) = next_page {
            self.page = next;
            return None;
        }

        info!(
            epoch = self.epoch,
            count = self.instances.len(),
            "synchronized runners"
        );

        Some(RunnerSnapshot {
            epoch: self.epoch,
            instances: std::mem::take(&mut self.instances),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::types::{RegistrationTokenPayload, RunnerPayload};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted target: each entry is one `get_runners` outcome.
    struct ScriptedTarget {
        script: Mutex<Vec<Result<(Vec<RunnerPayload>, Option<u32>)>>>,
    }

    impl ScriptedTarget {
        fn new(script: Vec<Result<(Vec<RunnerPayload>, Option<u32>)>>) -> Self {
            Self {
                script: Mutex::new(script),
            }
        }
    }

    #[async_trait]
    impl Target for ScriptedTarget {
        fn url(&self) -> String {
            "https://github.com/acme/widgets".into()
        }

        async fn get_runners(
            &self,
            _page: u32,
            _page_size: u32,
        ) -> Result<(Vec<RunnerPayload>, Option<u32>)> {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Err(anyhow!("script exhausted"));
            }
            script.remove(0)
        }

        async fn get_registration_token(&self) -> Result<RegistrationTokenPayload> {
            unimplemented!("not used by the synchronizer")
        }

        async fn delete_runner(&self, _id: i64) -> Result<()> {
            unimplemented!("not used by the synchronizer")
        }
    }

    fn runner(id: i64, name: &str, status: &str) -> RunnerPayload {
        RunnerPayload {
            id,
            name: name.into(),
            status: status.into(),
            busy: false,
            labels: vec![],
        }
    }

    #[tokio::test]
    async fn single_page_pass_publishes_epoch_one() {
        let target = ScriptedTarget::new(vec![Ok((vec![runner(42, "h1", "online")], None))]);
        let mut work = SyncWork::new(1, 100);

        let snapshot = work.step(&target).await.expect("pass should complete");
        assert_eq!(snapshot.epoch, 1);
        assert_eq!(snapshot.instances.len(), 1);
        assert!(snapshot.instances["h1"].is_online);
    }

    #[tokio::test]
    async fn multi_page_pass_publishes_once() {
        let target = ScriptedTarget::new(vec![
            Ok((vec![runner(1, "h1", "online")], Some(2))),
            Ok((vec![runner(2, "h2", "offline")], None)),
        ]);
        let mut work = SyncWork::new(1, 1);

        assert!(work.step(&target).await.is_none());
        assert_eq!(work.page, 2);

        let snapshot = work.step(&target).await.expect("pass should complete");
        assert_eq!(snapshot.epoch, 1);
        assert_eq!(snapshot.instances.len(), 2);
        assert!(!snapshot.instances["h2"].is_online);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_page_and_epoch() {
        let target = ScriptedTarget::new(vec![
            Ok((vec![runner(1, "h1", "online")], Some(2))),
            Err(anyhow!("transport error")),
            Ok((vec![runner(2, "h2", "online")], None)),
        ]);
        let mut work = SyncWork::new(3, 1);

        assert!(work.step(&target).await.is_none());
        assert!(work.step(&target).await.is_none());
        assert_eq!(work.page, 2, "failed tick must not advance the page");

        let snapshot = work.step(&target).await.expect("pass should complete");
        assert_eq!(snapshot.epoch, 3, "failed tick must not bump the epoch");
        assert_eq!(snapshot.instances.len(), 2);
    }

    #[tokio::test]
    async fn empty_listing_still_publishes() {
        let target = ScriptedTarget::new(vec![Ok((vec![], None))]);
        let mut work = SyncWork::new(1, 100);

        let snapshot = work.step(&target).await.expect("pass should complete");
        assert_eq!(snapshot.epoch, 1);
        assert!(snapshot.instances.is_empty());
    }

    #[tokio::test]
    async fn epochs_strictly_increase_across_passes() {
        let target = Arc::new(ScriptedTarget::new(vec![
            Ok((vec![], None)),
            Ok((vec![], None)),
            Ok((vec![], None)),
        ]));
        let metrics = ManagerMetrics::new(&prometheus::Registry::new()).unwrap();
        let sync = Synchronizer::new(
            &RunnersConfig {
                sync_interval_secs: Some(0),
                sync_page_size: None,
            },
            target,
            metrics,
        );

        let state = sync.state();
        let mut sub = state.subscribe();
        let shutdown = CancellationToken::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { sync.run(shutdown).await })
        };

        // Intermediate snapshots may coalesce, but whatever arrives must
        // carry a strictly larger epoch, and the last pass (epoch 3) is
        // always eventually delivered.
        let mut last = sub.wait().await.unwrap().epoch;
        assert_eq!(last, 0);
        while last < 3 {
            let snapshot = sub.wait().await.unwrap();
            assert!(snapshot.epoch > last);
            last = snapshot.epoch;
        }

        shutdown.cancel();
        let _ = task.await;
    }
}
