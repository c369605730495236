use crate::config::PartitionConfig;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Name of the monthly audit partition for a given month.
pub fn partition_name(year: i32, month: u32) -> String {
    format!("workflow_event_log_{year:04}_{month:02}")
}

/// The partition maintenance capability (SQL helpers in production).
#[async_trait]
pub trait PartitionMaintenance: Send + Sync {
    /// Create the partition for a month; returns false when it existed.
    async fn create_partition_for_month(&self, year: i32, month: u32) -> Result<bool>;
    /// Drop a partition; returns false when it did not exist.
    async fn drop_partition(&self, year: i32, month: u32) -> Result<bool>;
    /// Names of expected indexes missing from a partition.
    async fn check_partition_indexes(&self, partition: &str) -> Result<Vec<String>>;
    /// Existing partitions as (year, month).
    async fn list_partitions(&self) -> Result<Vec<(i32, u32)>>;
    async fn vacuum_analyze(&self) -> Result<()>;
}

/// Report from one maintenance run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionReport {
    pub created: Vec<String>,
    pub dropped: Vec<String>,
    pub index_drift: Vec<(String, Vec<String>)>,
    pub vacuumed: bool,
}

/// The daily partition lifecycle job: pre-create ahead, detect index drift,
/// drop beyond retention, vacuum after drops.
pub struct PartitionLifecycle {
    maintenance: std::sync::Arc<dyn PartitionMaintenance>,
    config: PartitionConfig,
}

fn add_months(date: NaiveDate, months: u32) -> NaiveDate {
    let zero_based = date.month0() + months;
    let year = date.year() + (zero_based / 12) as i32;
    let month = zero_based % 12 + 1;
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date)
}

impl PartitionLifecycle {
    pub fn new(
        maintenance: std::sync::Arc<dyn PartitionMaintenance>,
        config: PartitionConfig,
    ) -> Self {
        Self {
            maintenance,
            config,
        }
    }

    pub async fn run(&self, today: NaiveDate) -> Result<PartitionReport> {
        let mut report = PartitionReport::default();
        let current_month = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)
            .unwrap_or(today);

        // 1. Pre-create partitions N months ahead (current month included).
        for offset in 0..=self.config.precreate_months {
            let month = add_months(current_month, offset);
            if self
                .maintenance
                .create_partition_for_month(month.year(), month.month())
                .await?
            {
                report.created.push(partition_name(month.year(), month.month()));
            }
        }

        // 2. Index drift per existing partition.
        for (year, month) in self.maintenance.list_partitions().await? {
            let name = partition_name(year, month);
            let missing = self.maintenance.check_partition_indexes(&name).await?;
            if !missing.is_empty() {
                tracing::warn!(partition = %name, missing = ?missing, "partition index drift");
                report.index_drift.push((name, missing));
            }
        }

        // 3. Drop partitions fully past the retention window. A partition is
        // droppable when its successor month is already older than the cutoff.
        let cutoff = today - chrono::Duration::days(self.config.retention_days as i64);
        for (year, month) in self.maintenance.list_partitions().await? {
            let month_start = match NaiveDate::from_ymd_opt(year, month, 1) {
                Some(d) => d,
                None => continue,
            };
            let month_end = add_months(month_start, 1);
            if month_end < cutoff && self.maintenance.drop_partition(year, month).await? {
                report.dropped.push(partition_name(year, month));
            }
        }

        // 4. Vacuum only when something was dropped.
        if !report.dropped.is_empty() {
            self.maintenance.vacuum_analyze().await?;
            report.vacuumed = true;
        }

        Ok(report)
    }
}

// ─── Memory implementation ────────────────────────────────────

struct MaintenanceInner {
    /// (year, month) → missing index names.
    partitions: BTreeMap<(i32, u32), Vec<String>>,
    vacuum_runs: u32,
}

pub struct MemoryPartitionMaintenance {
    inner: RwLock<MaintenanceInner>,
}

impl MemoryPartitionMaintenance {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MaintenanceInner {
                partitions: BTreeMap::new(),
                vacuum_runs: 0,
            }),
        }
    }

    /// Seed a partition, optionally with drifted (missing) indexes.
    pub async fn seed(&self, year: i32, month: u32, missing_indexes: Vec<String>) {
        self.inner
            .write()
            .await
            .partitions
            .insert((year, month), missing_indexes);
    }

    pub async fn vacuum_runs(&self) -> u32 {
        self.inner.read().await.vacuum_runs
    }
}

impl Default for MemoryPartitionMaintenance {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PartitionMaintenance for MemoryPartitionMaintenance {
    async fn create_partition_for_month(&self, year: i32, month: u32) -> Result<bool> {
        let mut w = self.inner.write().await;
        if w.partitions.contains_key(&(year, month)) {
            return Ok(false);
        }
        w.partitions.insert((year, month), Vec::new());
        Ok(true)
    }

    async fn drop_partition(&self, year: i32, month: u32) -> Result<bool> {
        let mut w = self.inner.write().await;
        Ok(w.partitions.remove(&(year, month)).is_some())
    }

    async fn check_partition_indexes(&self, partition: &str) -> Result<Vec<String>> {
        let r = self.inner.read().await;
        Ok(r.partitions
            .iter()
            .find(|((y, m), _)| partition_name(*y, *m) == partition)
            .map(|(_, missing)| missing.clone())
            .unwrap_or_default())
    }

    async fn list_partitions(&self) -> Result<Vec<(i32, u32)>> {
        let r = self.inner.read().await;
        Ok(r.partitions.keys().copied().collect())
    }

    async fn vacuum_analyze(&self) -> Result<()> {
        self.inner.write().await.vacuum_runs += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn config() -> PartitionConfig {
        PartitionConfig {
            precreate_months: 2,
            retention_days: 90,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn precreates_months_ahead_idempotently() {
        let maintenance = Arc::new(MemoryPartitionMaintenance::new());
        let job = PartitionLifecycle::new(maintenance.clone(), config());

        let report = job.run(date(2026, 11, 15)).await.unwrap();
        assert_eq!(
            report.created,
            vec![
                "workflow_event_log_2026_11",
                "workflow_event_log_2026_12",
                "workflow_event_log_2027_01",
            ]
        );

        // Second run creates nothing new.
        let report = job.run(date(2026, 11, 16)).await.unwrap();
        assert!(report.created.is_empty());
    }

    #[tokio::test]
    async fn drops_partitions_past_retention_and_vacuums() {
        let maintenance = Arc::new(MemoryPartitionMaintenance::new());
        // 90-day retention, running on 2026-11-15: cutoff is 2026-08-17.
        // July 2026 ends 2026-08-01 (< cutoff) → dropped.
        // August ends 2026-09-01 (≥ cutoff) → kept.
        maintenance.seed(2026, 7, vec![]).await;
        maintenance.seed(2026, 8, vec![]).await;

        let job = PartitionLifecycle::new(maintenance.clone(), config());
        let report = job.run(date(2026, 11, 15)).await.unwrap();

        assert_eq!(report.dropped, vec!["workflow_event_log_2026_07"]);
        assert!(report.vacuumed);
        assert_eq!(maintenance.vacuum_runs().await, 1);

        // Nothing further to drop → no vacuum.
        let report = job.run(date(2026, 11, 15)).await.unwrap();
        assert!(report.dropped.is_empty());
        assert!(!report.vacuumed);
    }

    #[tokio::test]
    async fn reports_index_drift() {
        let maintenance = Arc::new(MemoryPartitionMaintenance::new());
        maintenance
            .seed(2026, 10, vec!["idx_tenant".to_string()])
            .await;

        let job = PartitionLifecycle::new(maintenance.clone(), config());
        let report = job.run(date(2026, 10, 2)).await.unwrap();
        assert_eq!(report.index_drift.len(), 1);
        assert_eq!(report.index_drift[0].0, "workflow_event_log_2026_10");
    }
}
