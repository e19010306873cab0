use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::SandboxService;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Periodically destroys sandboxes whose TTL has run out.
pub struct Janitor {
    service: Arc<SandboxService>,
    interval: Duration,
    cancel: CancellationToken,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Janitor {
    /// Creates a janitor sweeping at the service's configured interval.
    pub fn new(service: Arc<SandboxService>) -> Self {
        let interval = service.config().janitor_interval;
        Self {
            service,
            interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Overrides the sweep interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// A token that stops the janitor when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs one sweep and returns the ids of the sandboxes destroyed.
    pub async fn sweep(&self) -> Vec<String> {
        match self.service.reap_expired().await {
            Ok(destroyed) => {
                if !destroyed.is_empty() {
                    tracing::info!(count = destroyed.len(), "janitor destroyed expired sandboxes");
                }
                destroyed
            }
            Err(e) => {
                tracing::error!(error = %e, "janitor failed to list expired sandboxes");
                Vec::new()
            }
        }
    }

    /// Sweeps immediately, then once per interval until cancelled.
    pub async fn run(self) {
        tracing::info!(interval_secs = self.interval.as_secs(), "janitor started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }

        tracing::info!("janitor stopped");
    }

    /// Runs the janitor on its own task.
    pub fn spawn(self) -> (CancellationToken, JoinHandle<()>) {
        let cancel = self.cancellation_token();
        (cancel, tokio::spawn(self.run()))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::{
        service::{
            fake::{manager, ok, FakeHost, FakeSsh},
            CreateSandboxRequest, ServiceConfig,
        },
        store::{SandboxState, SqliteStore, Store},
        utils::{Clock, ManualClock},
        VirshboxError,
    };

    async fn service(
        host: Arc<FakeHost>,
        clock: Arc<ManualClock>,
        default_ttl: Option<Duration>,
    ) -> anyhow::Result<Arc<SandboxService>> {
        let store = SqliteStore::in_memory()
            .await?
            .with_clock(clock.clone() as Arc<dyn Clock>);
        let config = match default_ttl {
            Some(ttl) => ServiceConfig::builder().default_ttl(ttl).build(),
            None => ServiceConfig::default(),
        };

        Ok(Arc::new(
            SandboxService::builder()
                .manager(manager(host))
                .store(Arc::new(store))
                .config(config)
                .ssh(FakeSsh::replying(ok("")))
                .clock(clock)
                .build(),
        ))
    }

    fn request(name: &str, ttl: Option<u64>) -> CreateSandboxRequest {
        let mut request = CreateSandboxRequest::builder()
            .source("base-ubuntu")
            .agent_id("agent-1")
            .name(name)
            .build();
        request.ttl_seconds = ttl;
        request
    }

    #[tokio::test]
    async fn test_sweep_destroys_expired_sandboxes() -> anyhow::Result<()> {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 8, 12, 0, 0).unwrap()));
        let host = FakeHost::with_base_domain();
        let svc = service(host.clone(), clock.clone(), None).await?;

        let short = svc.create_sandbox(request("sbx-short", Some(60))).await?;
        let long = svc.create_sandbox(request("sbx-long", Some(3600))).await?;
        let forever = svc.create_sandbox(request("sbx-forever", None)).await?;

        let janitor = Janitor::new(svc.clone());
        assert!(janitor.sweep().await.is_empty());

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(janitor.sweep().await, vec![short.id.clone()]);
        assert!(host.called("undefine sbx-short"));
        assert!(matches!(
            svc.get_sandbox(&short.id).await,
            Err(VirshboxError::NotFound(_))
        ));

        clock.advance(chrono::Duration::days(1));
        assert_eq!(janitor.sweep().await, vec![long.id.clone()]);
        assert_eq!(
            svc.get_sandbox(&forever.id).await?.state,
            SandboxState::Created
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_applies_default_ttl() -> anyhow::Result<()> {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 8, 12, 0, 0).unwrap()));
        let svc = service(
            FakeHost::with_base_domain(),
            clock.clone(),
            Some(Duration::from_secs(300)),
        )
        .await?;

        let sandbox = svc.create_sandbox(request("sbx-1", None)).await?;
        let janitor = Janitor::new(svc.clone());

        clock.advance(chrono::Duration::seconds(299));
        assert!(janitor.sweep().await.is_empty());

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(janitor.sweep().await, vec![sandbox.id]);
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_continues_past_failures() -> anyhow::Result<()> {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 8, 12, 0, 0).unwrap()));
        let svc = service(FakeHost::with_base_domain(), clock.clone(), None).await?;

        let first = svc.create_sandbox(request("sbx-1", Some(10))).await?;
        let second = svc.create_sandbox(request("sbx-2", Some(10))).await?;

        // Points at a fleet host the service does not know.
        let mut orphan = first.clone();
        orphan.host_name = Some("gone".to_string());
        svc.store().update_sandbox(&orphan).await?;

        clock.advance(chrono::Duration::seconds(11));
        let destroyed = Janitor::new(svc.clone()).sweep().await;
        assert_eq!(destroyed, vec![second.id]);
        assert!(svc.get_sandbox(&first.id).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_run_stops_when_cancelled() -> anyhow::Result<()> {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 8, 12, 0, 0).unwrap()));
        let host = FakeHost::with_base_domain();
        let svc = service(host.clone(), clock.clone(), None).await?;
        svc.create_sandbox(request("sbx-1", Some(10))).await?;
        clock.advance(chrono::Duration::seconds(11));

        let (cancel, handle) = Janitor::new(svc.clone())
            .with_interval(Duration::from_millis(20))
            .spawn();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !host.called("undefine sbx-1") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await??;
        Ok(())
    }
}
