//! Client contract and orchestration for the external calibration service.
//!
//! Calibration is submit-then-poll: the population summary goes out, a job
//! id comes back, and the job is polled until it completes, fails, or the
//! attempt budget runs out. The result is ingested into a scoring-ready
//! policy and cached per `(period, sector)` until its validity lapses.
//! Every failure path is fail-closed; no stale or default policy is ever
//! substituted for a calibration that did not complete.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::CalibrationConfig;
use crate::scoring::bins::{FeatureBin, PopulationSummary};
use crate::scoring::canonical::Period;
use crate::scoring::engine::ScoringPolicy;
use crate::scoring::policy::{policy_from_calibration, PolicyError};

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("calibration did not complete after {attempts} poll attempts")]
    Timeout { attempts: u32 },
    #[error("calibration job failed: {0}")]
    Failed(String),
    #[error("calibration transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Opaque handle to a submitted calibration job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(pub String);

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Completed(Value),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayloadStats {
    pub pop_total: usize,
}

/// What the calibration service sees: binned histograms and presence rates,
/// never account-level rows.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationPayload {
    pub periodo: String,
    pub features: BTreeMap<&'static str, Vec<FeatureBin>>,
    pub presence: BTreeMap<&'static str, f64>,
    pub stats: PayloadStats,
}

impl CalibrationPayload {
    pub fn new(period: Period, summary: &PopulationSummary) -> Self {
        Self {
            periodo: period.month_key(),
            features: summary.features.clone(),
            presence: summary.presence.clone(),
            stats: PayloadStats {
                pop_total: summary.population,
            },
        }
    }
}

/// Transport seam to the calibration service.
pub trait CalibrationClient: Send + Sync {
    fn submit(
        &self,
        payload: CalibrationPayload,
    ) -> impl Future<Output = Result<JobId, CalibrationError>> + Send;

    fn poll(&self, job: &JobId)
        -> impl Future<Output = Result<JobStatus, CalibrationError>> + Send;
}

#[derive(Clone)]
struct CacheEntry {
    policy: Arc<ScoringPolicy>,
    expires_at: Instant,
}

type CacheKey = (String, Option<String>);
type CacheSlot = Arc<OnceCell<CacheEntry>>;

/// Runs the submit/poll cycle and caches ingested policies.
///
/// Concurrent requests for the same `(period, sector)` share one in-flight
/// calibration; a failed or expired slot is dropped so the next caller
/// starts a fresh cycle.
pub struct Calibrator<C> {
    client: C,
    config: CalibrationConfig,
    cache: Mutex<HashMap<CacheKey, CacheSlot>>,
}

impl<C: CalibrationClient> Calibrator<C> {
    pub fn new(client: C, config: CalibrationConfig) -> Self {
        Self {
            client,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub async fn policy_for(
        &self,
        period: Period,
        sector: Option<&str>,
        summary: &PopulationSummary,
    ) -> Result<Arc<ScoringPolicy>, CalibrationError> {
        let key: CacheKey = (period.month_key(), sector.map(str::to_string));
        loop {
            let slot = {
                let mut cache = self.cache.lock().expect("calibration cache mutex poisoned");
                cache.entry(key.clone()).or_default().clone()
            };

            match slot
                .get_or_try_init(|| self.calibrate(period, sector, summary))
                .await
            {
                Ok(entry) if entry.expires_at > Instant::now() => {
                    return Ok(entry.policy.clone())
                }
                Ok(_) => {
                    debug!(periodo = %key.0, "cached policy expired, recalibrating");
                    self.evict(&key, &slot);
                }
                Err(err) => {
                    self.evict(&key, &slot);
                    return Err(err);
                }
            }
        }
    }

    fn evict(&self, key: &CacheKey, slot: &CacheSlot) {
        let mut cache = self.cache.lock().expect("calibration cache mutex poisoned");
        // only drop the slot we resolved against; a newer one stays
        if cache.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            cache.remove(key);
        }
    }

    async fn calibrate(
        &self,
        period: Period,
        sector: Option<&str>,
        summary: &PopulationSummary,
    ) -> Result<CacheEntry, CalibrationError> {
        let payload = CalibrationPayload::new(period, summary);
        let job = self.client.submit(payload).await?;
        debug!(job = %job.0, periodo = %period.month_key(), "calibration submitted");

        for attempt in 1..=self.config.max_poll_attempts {
            match self.client.poll(&job).await? {
                JobStatus::Completed(raw) => {
                    let calibrated = policy_from_calibration(&raw)?;
                    let policy = ScoringPolicy::from_calibrated(calibrated);
                    info!(
                        policy_id = %policy.policy_id,
                        periodo = %period.month_key(),
                        sector = sector.unwrap_or("-"),
                        attempt,
                        "calibration complete"
                    );
                    let ttl_days = policy.validity_days;
                    let ttl = if ttl_days.is_finite() && ttl_days > 0.0 {
                        Duration::from_secs_f64(ttl_days * 86_400.0)
                    } else {
                        Duration::ZERO
                    };
                    return Ok(CacheEntry {
                        policy: Arc::new(policy),
                        expires_at: Instant::now() + ttl,
                    });
                }
                JobStatus::Failed(reason) => return Err(CalibrationError::Failed(reason)),
                JobStatus::Pending => {
                    if attempt < self.config.max_poll_attempts {
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
            }
        }

        Err(CalibrationError::Timeout {
            attempts: self.config.max_poll_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedClient {
        script: Mutex<VecDeque<JobStatus>>,
        submits: AtomicUsize,
        polls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(script: Vec<JobStatus>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                submits: AtomicUsize::new(0),
                polls: AtomicUsize::new(0),
            }
        }

        fn submit_count(&self) -> usize {
            self.submits.load(Ordering::SeqCst)
        }
    }

    impl CalibrationClient for &ScriptedClient {
        async fn submit(&self, _payload: CalibrationPayload) -> Result<JobId, CalibrationError> {
            tokio::task::yield_now().await;
            self.submits.fetch_add(1, Ordering::SeqCst);
            Ok(JobId("job-1".to_string()))
        }

        async fn poll(&self, _job: &JobId) -> Result<JobStatus, CalibrationError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().expect("script mutex poisoned");
            Ok(script.pop_front().unwrap_or(JobStatus::Pending))
        }
    }

    fn fast_config(max_poll_attempts: u32) -> CalibrationConfig {
        CalibrationConfig {
            max_poll_attempts,
            poll_interval: Duration::from_millis(1),
        }
    }

    fn compact_result() -> Value {
        json!({
            "policy_id": "pc-1",
            "familias": { "cadastro": 0.3, "medicao": 0.5, "inadimplencia": 0.2 },
        })
    }

    fn summary() -> PopulationSummary {
        PopulationSummary::summarize(&[])
    }

    fn period() -> Period {
        Period::parse("2025-01").expect("valid period")
    }

    #[tokio::test]
    async fn completed_job_yields_an_ingested_policy() {
        let client = ScriptedClient::new(vec![
            JobStatus::Pending,
            JobStatus::Completed(compact_result()),
        ]);
        let calibrator = Calibrator::new(&client, fast_config(5));

        let policy = calibrator
            .policy_for(period(), Some("S01"), &summary())
            .await
            .expect("calibration completes");
        assert_eq!(policy.policy_id, "pc-1");
        assert_eq!(client.submit_count(), 1);
    }

    #[tokio::test]
    async fn cached_policy_is_reused_without_a_second_submit() {
        let client = ScriptedClient::new(vec![JobStatus::Completed(compact_result())]);
        let calibrator = Calibrator::new(&client, fast_config(5));

        let first = calibrator
            .policy_for(period(), Some("S01"), &summary())
            .await
            .expect("first run completes");
        let second = calibrator
            .policy_for(period(), Some("S01"), &summary())
            .await
            .expect("second run hits the cache");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(client.submit_count(), 1);
    }

    #[tokio::test]
    async fn distinct_sectors_calibrate_separately() {
        let client = ScriptedClient::new(vec![
            JobStatus::Completed(compact_result()),
            JobStatus::Completed(compact_result()),
        ]);
        let calibrator = Calibrator::new(&client, fast_config(5));

        calibrator
            .policy_for(period(), Some("S01"), &summary())
            .await
            .expect("S01 completes");
        calibrator
            .policy_for(period(), Some("S02"), &summary())
            .await
            .expect("S02 completes");
        assert_eq!(client.submit_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_calibration() {
        let client = ScriptedClient::new(vec![JobStatus::Completed(compact_result())]);
        let calibrator = Calibrator::new(&client, fast_config(5));

        let summary = summary();
        let (a, b) = tokio::join!(
            calibrator.policy_for(period(), Some("S01"), &summary),
            calibrator.policy_for(period(), Some("S01"), &summary),
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(client.submit_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_time_out() {
        let client = ScriptedClient::new(vec![]);
        let calibrator = Calibrator::new(&client, fast_config(3));

        let err = calibrator
            .policy_for(period(), None, &summary())
            .await
            .expect_err("pending forever must time out");
        assert!(matches!(err, CalibrationError::Timeout { attempts: 3 }));
        assert_eq!(client.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_job_is_not_cached() {
        let client = ScriptedClient::new(vec![
            JobStatus::Failed("bad population".to_string()),
            JobStatus::Completed(compact_result()),
        ]);
        let calibrator = Calibrator::new(&client, fast_config(5));

        let err = calibrator
            .policy_for(period(), None, &summary())
            .await
            .expect_err("failed job surfaces");
        assert!(matches!(err, CalibrationError::Failed(_)));

        calibrator
            .policy_for(period(), None, &summary())
            .await
            .expect("retry starts a fresh cycle");
        assert_eq!(client.submit_count(), 2);
    }

    #[tokio::test]
    async fn unusable_calibration_result_fails_closed() {
        let client = ScriptedClient::new(vec![JobStatus::Completed(json!({"nonsense": true}))]);
        let calibrator = Calibrator::new(&client, fast_config(5));

        let err = calibrator
            .policy_for(period(), None, &summary())
            .await
            .expect_err("unrecognized shape is rejected");
        assert!(matches!(err, CalibrationError::Policy(_)));
    }

    #[test]
    fn payload_carries_histograms_not_rows() {
        let payload = CalibrationPayload::new(period(), &summary());
        assert_eq!(payload.periodo, "2025-01");
        assert_eq!(payload.stats.pop_total, 0);
        assert_eq!(payload.features.len(), 7);
        let encoded = serde_json::to_value(&payload).expect("payload serializes");
        assert!(encoded.get("stats").is_some());
    }
}
