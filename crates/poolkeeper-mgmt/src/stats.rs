//! Periodic pool usage sampling into bounded per-pool series.
//!
//! A sample holds the pool's lock only for one bounded query; a query that
//! outlives `query_timeout` is abandoned and counted as failed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AdminError, AdminResult};
use crate::pool_manager::PoolManager;
use crate::types::PoolStatPoint;

/// Fixed-capacity series; the oldest point is dropped when full.
#[derive(Debug, Clone)]
pub struct StatRing {
    points: VecDeque<PoolStatPoint>,
    capacity: usize,
}

impl StatRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, point: PoolStatPoint) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    /// Drops points with `time < cutoff`.
    pub fn evict_older_than(&mut self, cutoff: i64) -> usize {
        let before = self.points.len();
        while matches!(self.points.front(), Some(p) if p.time < cutoff) {
            self.points.pop_front();
        }
        before - self.points.len()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &PoolStatPoint> {
        self.points.iter()
    }

    pub fn latest(&self) -> Option<&PoolStatPoint> {
        self.points.back()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Clone)]
pub struct StatsConfig {
    pub interval: Duration,
    pub capacity: usize,
    pub max_age_secs: Option<u64>,
    /// Upper bound on one pool's stats query.
    pub query_timeout: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            capacity: 1440,
            max_age_secs: None,
            query_timeout: Duration::from_secs(10),
        }
    }
}

/// Oldest point time kept when points may be at most `max_age` seconds old.
fn age_cutoff(now: i64, max_age: u64) -> i64 {
    now.saturating_sub(i64::try_from(max_age).unwrap_or(i64::MAX))
}

/// Outcome counts for one sampling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub sampled: usize,
    pub skipped_busy: usize,
    pub failed: usize,
}

enum Sample {
    Point(String, PoolStatPoint),
    Busy,
    Failed,
}

pub struct StatsCollector {
    manager: Arc<PoolManager>,
    series: RwLock<HashMap<String, StatRing>>,
    config: StatsConfig,
}

impl StatsCollector {
    pub fn new(manager: Arc<PoolManager>, config: StatsConfig) -> Self {
        Self {
            manager,
            series: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    /// Samples every inventory pool once. Pools whose lock is held by a
    /// mutation are skipped rather than waited on.
    pub async fn tick(&self) -> TickReport {
        self.manager.reconcile(None).await;
        let names = self.manager.pool_names();
        let samples = join_all(names.iter().map(|name| self.sample(name))).await;

        let mut report = TickReport::default();
        let mut series = self.series.write();
        series.retain(|pool, _| names.contains(pool));
        for sample in samples {
            match sample {
                Sample::Point(pool, point) => {
                    let time = point.time;
                    let ring = series
                        .entry(pool)
                        .or_insert_with(|| StatRing::new(self.config.capacity));
                    ring.push(point);
                    if let Some(max_age) = self.config.max_age_secs {
                        ring.evict_older_than(age_cutoff(time, max_age));
                    }
                    report.sampled += 1;
                }
                Sample::Busy => report.skipped_busy += 1,
                Sample::Failed => report.failed += 1,
            }
        }
        debug!(
            sampled = report.sampled,
            busy = report.skipped_busy,
            failed = report.failed,
            "stats tick"
        );
        report
    }

    async fn sample(&self, name: &str) -> Sample {
        let Some(_guard) = self.manager.locks().try_lock(name) else {
            debug!(pool = %name, "pool busy, skipping sample");
            return Sample::Busy;
        };
        let query = self.manager.executor().query_stats(name);
        match tokio::time::timeout(self.config.query_timeout, query).await {
            Err(_) => {
                warn!(
                    pool = %name,
                    timeout_ms = self.config.query_timeout.as_millis() as u64,
                    "stats query timed out"
                );
                Sample::Failed
            }
            Ok(Ok(usage)) => Sample::Point(
                name.to_string(),
                PoolStatPoint {
                    time: Utc::now().timestamp(),
                    allocated: usage.allocated,
                    free: usage.free,
                    size: usage.size,
                    dedup_ratio: usage.dedup_ratio,
                },
            ),
            Ok(Err(err)) => {
                warn!(pool = %name, error = %err, "stats query failed");
                Sample::Failed
            }
        }
    }

    /// Up to `limit` most recent points for `pool`, oldest first.
    pub fn series(&self, pool: &str, limit: Option<usize>) -> AdminResult<Vec<PoolStatPoint>> {
        self.manager.get_pool(pool)?;
        let series = self.series.read();
        let Some(ring) = series.get(pool) else {
            return Ok(Vec::new());
        };
        let skip = limit.map_or(0, |l| ring.len().saturating_sub(l));
        Ok(ring.iter().skip(skip).cloned().collect())
    }

    pub fn latest(&self, pool: &str) -> AdminResult<PoolStatPoint> {
        self.series
            .read()
            .get(pool)
            .and_then(|r| r.latest().cloned())
            .ok_or_else(|| AdminError::NotFound {
                what: format!("stats for pool {}", pool),
            })
    }

    /// Samples on `config.interval` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.config.interval.as_secs(), "stats collector started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("stats collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit_trail::AuditLogger;
    use crate::auth::AuthContext;
    use crate::executor::PoolUsage;
    use crate::mock_executor::{MockExecutor, MockOp};
    use crate::types::{RaidType, Vdev, Zpool};

    fn point(time: i64) -> PoolStatPoint {
        PoolStatPoint {
            time,
            allocated: 0,
            free: 0,
            size: 0,
            dedup_ratio: 1.0,
        }
    }

    async fn setup(capacity: usize) -> (Arc<StatsCollector>, Arc<PoolManager>, Arc<MockExecutor>) {
        let exec = Arc::new(MockExecutor::new());
        let manager = Arc::new(PoolManager::new(exec.clone(), AuditLogger::in_memory()));
        for (name, disks) in [("tank", ["/dev/da0", "/dev/da1"]), ("t2", ["/dev/da2", "/dev/da3"])] {
            manager
                .create_pool(
                    &AuthContext::system("admin"),
                    Zpool {
                        name: name.into(),
                        raid_type: RaidType::Mirror,
                        vdevs: vec![Vdev::new("", &disks)],
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        let stats = Arc::new(StatsCollector::new(
            manager.clone(),
            StatsConfig {
                capacity,
                ..Default::default()
            },
        ));
        (stats, manager, exec)
    }

    #[test]
    fn test_ring_bounded() {
        let mut ring = StatRing::new(3);
        for t in 0..10 {
            ring.push(point(t));
        }
        assert_eq!(ring.len(), 3);
        let times: Vec<i64> = ring.iter().map(|p| p.time).collect();
        assert_eq!(times, vec![7, 8, 9]);
        assert_eq!(ring.latest().map(|p| p.time), Some(9));
    }

    #[test]
    fn test_ring_evicts_by_age() {
        let mut ring = StatRing::new(10);
        for t in [100, 150, 200, 250] {
            ring.push(point(t));
        }
        assert_eq!(ring.evict_older_than(200), 2);
        assert_eq!(ring.iter().next().map(|p| p.time), Some(200));
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut ring = StatRing::new(0);
        ring.push(point(1));
        ring.push(point(2));
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.len(), 1);
    }

    #[tokio::test]
    async fn test_tick_samples_all_pools() {
        let (stats, _, exec) = setup(8).await;
        exec.set_usage(
            "tank",
            PoolUsage {
                allocated: 10,
                free: 90,
                size: 100,
                dedup_ratio: 1.5,
            },
        );
        let report = stats.tick().await;
        assert_eq!(report.sampled, 2);
        let latest = stats.latest("tank").unwrap();
        assert_eq!(latest.size, 100);
        assert_eq!(latest.dedup_ratio, 1.5);
    }

    #[tokio::test]
    async fn test_busy_pool_skipped() {
        let (stats, manager, _) = setup(8).await;
        let _held = manager.locks().lock("tank").await;
        let report = stats.tick().await;
        assert_eq!(report.skipped_busy, 1);
        assert_eq!(report.sampled, 1);
        assert!(stats.series("tank", None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_query_counted() {
        let (stats, _, exec) = setup(8).await;
        exec.fail(MockOp::Stats, "io error");
        let report = stats.tick().await;
        assert_eq!(report.failed, 2);
        assert!(stats.latest("tank").is_err());
    }

    #[tokio::test]
    async fn test_one_failing_pool_does_not_block_others() {
        let (stats, _, exec) = setup(8).await;
        exec.fail_stats_for("t2", "checksum errors");
        let report = stats.tick().await;
        assert_eq!(
            report,
            TickReport {
                sampled: 1,
                skipped_busy: 0,
                failed: 1,
            }
        );
        assert!(stats.latest("tank").is_ok());
        assert!(stats.latest("t2").is_err());
        assert!(stats.series("t2", None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hung_query_times_out_and_frees_lock() {
        let exec = Arc::new(MockExecutor::new());
        let manager = Arc::new(PoolManager::new(exec.clone(), AuditLogger::in_memory()));
        manager
            .create_pool(
                &AuthContext::system("admin"),
                Zpool {
                    name: "tank".into(),
                    raid_type: RaidType::Mirror,
                    vdevs: vec![Vdev::new("", &["/dev/da0", "/dev/da1"])],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        exec.set_stats_delay(Duration::from_secs(5));
        let stats = StatsCollector::new(
            manager.clone(),
            StatsConfig {
                query_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );

        let started = tokio::time::Instant::now();
        let report = stats.tick().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.failed, 1);
        assert!(!manager.locks().is_locked("tank"));
        manager
            .export_pool(&AuthContext::system("admin"), "tank")
            .await
            .unwrap();
    }

    #[test]
    fn test_age_cutoff_saturates() {
        assert_eq!(age_cutoff(1_000, 100), 900);
        assert_eq!(age_cutoff(1_000, u64::MAX), 1_000 - i64::MAX);
        assert_eq!(age_cutoff(-5, u64::MAX), i64::MIN);
    }

    #[tokio::test]
    async fn test_huge_max_age_keeps_points() {
        let (_, manager, _) = setup(8).await;
        let stats = StatsCollector::new(
            manager,
            StatsConfig {
                max_age_secs: Some(u64::MAX),
                ..Default::default()
            },
        );
        stats.tick().await;
        stats.tick().await;
        assert_eq!(stats.series("tank", None).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_series_limit_and_bound() {
        let (stats, _, _) = setup(4).await;
        for _ in 0..6 {
            stats.tick().await;
        }
        assert_eq!(stats.series("tank", None).unwrap().len(), 4);
        assert_eq!(stats.series("tank", Some(2)).unwrap().len(), 2);
        assert!(matches!(
            stats.series("ghost", None),
            Err(AdminError::PoolNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_destroyed_pool_series_dropped() {
        let (stats, manager, _) = setup(4).await;
        stats.tick().await;
        manager
            .destroy_pool(&AuthContext::system("admin"), "t2", true)
            .await
            .unwrap();
        stats.tick().await;
        assert!(stats.latest("t2").is_err());
        assert!(stats.latest("tank").is_ok());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (stats, _, _) = setup(4).await;
        let token = CancellationToken::new();
        let handle = tokio::spawn(stats.clone().run(token.clone()));
        token.cancel();
        handle.await.unwrap();
    }
}
