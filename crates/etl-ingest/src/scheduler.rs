//! Periodic trigger
//!
//! Owns the source clients and runs every one of them through the
//! orchestrator, concurrently, once per tick. A failing source is logged and
//! does not stop the others.

use etl_common::{EtlError, ErrorKind, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::{PipelineConfig, DEFAULT_RUN_TIMEOUT_SECS, DEFAULT_SCHEDULE_INTERVAL_SECS};
use crate::orchestrator::{RunOrchestrator, RunSummary};
use crate::source::SourceClient;
use crate::store::PipelineStore;

/// Result of one source's run within a pass
#[derive(Debug)]
pub struct SourceOutcome {
    pub source_name: String,
    pub result: Result<RunSummary>,
}

impl SourceOutcome {
    pub fn is_failure(&self) -> bool {
        self.result.is_err()
    }
}

pub struct Scheduler<S: PipelineStore + ?Sized> {
    orchestrator: Arc<RunOrchestrator<S>>,
    sources: Vec<Box<dyn SourceClient>>,
    interval: Duration,
    run_timeout: Duration,
}

impl<S: PipelineStore + ?Sized + 'static> Scheduler<S> {
    pub fn new(orchestrator: Arc<RunOrchestrator<S>>, sources: Vec<Box<dyn SourceClient>>) -> Self {
        Self {
            orchestrator,
            sources,
            interval: Duration::from_secs(DEFAULT_SCHEDULE_INTERVAL_SECS),
            run_timeout: Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS),
        }
    }

    pub fn from_config(
        orchestrator: Arc<RunOrchestrator<S>>,
        sources: Vec<Box<dyn SourceClient>>,
        config: &PipelineConfig,
    ) -> Self {
        Self::new(orchestrator, sources)
            .with_interval(Duration::from_secs(config.schedule_interval_secs))
            .with_run_timeout(Duration::from_secs(config.run_timeout_secs))
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Run every source once, concurrently.
    pub async fn run_all(&mut self) -> Vec<SourceOutcome> {
        let Self {
            orchestrator,
            sources,
            run_timeout,
            ..
        } = self;
        let run_timeout = *run_timeout;

        info!(sources = sources.len(), "Starting pipeline pass");

        let runs = sources.iter_mut().map(|source| {
            let orchestrator = orchestrator.clone();
            async move { run_with_timeout(&orchestrator, source.as_mut(), run_timeout).await }
        });
        let outcomes = join_all(runs).await;

        let failed = outcomes.iter().filter(|o| o.is_failure()).count();
        if failed > 0 {
            warn!(failed, total = outcomes.len(), "Pipeline pass finished with failures");
        } else {
            info!(total = outcomes.len(), "Pipeline pass finished");
        }

        outcomes
    }

    /// Run a single source by name. `None` if no such source is configured.
    pub async fn run_one(&mut self, name: &str) -> Option<SourceOutcome> {
        let run_timeout = self.run_timeout;
        let source = self.sources.iter_mut().find(|s| s.name() == name)?;
        Some(run_with_timeout(&self.orchestrator, source.as_mut(), run_timeout).await)
    }

    /// Spawn the periodic loop. The first pass starts immediately.
    pub fn start(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs(),
                sources = ?self.source_names(),
                "Scheduler started"
            );

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                self.run_all().await;
            }
        })
    }
}

async fn run_with_timeout<S: PipelineStore + ?Sized>(
    orchestrator: &RunOrchestrator<S>,
    source: &mut dyn SourceClient,
    run_timeout: Duration,
) -> SourceOutcome {
    let source_name = source.name().to_string();
    let kind = source.kind();

    let result = match tokio::time::timeout(run_timeout, orchestrator.run(source)).await {
        Ok(result) => result,
        Err(_) => Err(EtlError::unexpected(ErrorKind::Extraction, "Run timed out")
            .with_context("source_kind", kind)
            .with_context("source_name", &source_name)
            .with_context("timeout_secs", run_timeout.as_secs())),
    };

    if let Err(e) = &result {
        error!(source = %source_name, error = %e, "Source run failed");
    }

    SourceOutcome { source_name, result }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::{Payload, RunStatus, SourceKind, WatermarkType};
    use crate::source::field_text;
    use crate::store::{ItemStore, MemoryStore};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    struct Canned {
        name: String,
        payloads: Vec<Payload>,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl SourceClient for Canned {
        fn kind(&self) -> SourceKind {
            SourceKind::Api
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn watermark_type(&self) -> WatermarkType {
            WatermarkType::Id
        }

        async fn fetch(&mut self, _watermark: Option<&str>) -> Result<Vec<Payload>> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(EtlError::network("upstream down"));
            }
            Ok(std::mem::take(&mut self.payloads))
        }

        fn external_id(&self, payload: &Payload) -> String {
            field_text(payload, "id").unwrap_or_default()
        }

        fn extract_timestamp(&self, _payload: &Payload) -> Option<DateTime<Utc>> {
            None
        }
    }

    fn canned(name: &str, fail: bool) -> Box<dyn SourceClient> {
        Box::new(Canned {
            name: name.to_string(),
            payloads: vec![json!({ "id": 1, "name": "one" })],
            fail,
            delay: Duration::ZERO,
        })
    }

    #[tokio::test]
    async fn test_failing_source_does_not_stop_others() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Arc::new(RunOrchestrator::new(store.clone()));
        let mut scheduler = Scheduler::new(orchestrator, vec![canned("good", false), canned("bad", true)]);

        let outcomes = scheduler.run_all().await;
        assert_eq!(outcomes.len(), 2);

        let good = outcomes.iter().find(|o| o.source_name == "good").unwrap();
        assert_eq!(good.result.as_ref().unwrap().status, RunStatus::Success);
        let bad = outcomes.iter().find(|o| o.source_name == "bad").unwrap();
        assert!(bad.is_failure());

        assert_eq!(store.count_items(SourceKind::Api, "good").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Arc::new(RunOrchestrator::new(store));
        let slow = Box::new(Canned {
            name: "slow".to_string(),
            payloads: Vec::new(),
            fail: false,
            delay: Duration::from_secs(5),
        });
        let mut scheduler =
            Scheduler::new(orchestrator, vec![slow]).with_run_timeout(Duration::from_millis(20));

        let outcome = scheduler.run_one("slow").await.unwrap();
        let err = outcome.result.unwrap_err();
        assert_eq!(err.context_value("timeout_secs"), Some("0"));
        assert!(scheduler.run_one("missing").await.is_none());
    }
}
