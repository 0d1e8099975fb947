use crate::error::{DistributionError, Result};
use crate::rebuild::DistributionWorker;
use crate::types::{RunStatus, ScheduleConfig};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, TimeZone, Utc, Weekday};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Wall clock the calendar loop reads
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const IDLE: u8 = 0;
const REBUILDING: u8 = 1;

/// Scheduler state; a rebuild never overlaps another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Rebuilding,
}

/// What asked for a rebuild
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Bootstrap,
    Calendar,
    Manual,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Completed(RunStatus),
    /// A rebuild was already in flight
    Skipped,
    Failed(String),
}

/// Returns the scheduler to `Idle` however the rebuild ends
struct RebuildGuard<'a> {
    state: &'a AtomicU8,
}

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        self.state.store(IDLE, Ordering::SeqCst);
    }
}

/// Fixed weekly fire times at a fixed UTC offset
#[derive(Debug, Clone)]
pub struct WeeklySchedule {
    weekdays: Vec<Weekday>,
    time: NaiveTime,
    offset: FixedOffset,
}

impl WeeklySchedule {
    pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
        let mut weekdays = config
            .weekdays
            .iter()
            .map(|day| {
                day.trim()
                    .parse::<Weekday>()
                    .map_err(|_| DistributionError::from(format!("Unknown schedule weekday '{}'", day)))
            })
            .collect::<Result<Vec<_>>>()?;
        weekdays.sort_by_key(|day| day.num_days_from_monday());
        weekdays.dedup();

        if weekdays.is_empty() {
            return Err("Schedule needs at least one weekday".into());
        }

        let time = NaiveTime::from_hms_opt(config.hour, config.minute, 0)
            .ok_or_else(|| DistributionError::from("Invalid schedule time"))?;
        let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60)
            .ok_or_else(|| DistributionError::from("Invalid schedule UTC offset"))?;

        Ok(Self {
            weekdays,
            time,
            offset,
        })
    }

    /// First fire time strictly after `now`
    pub fn next_fire_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local_now = now.with_timezone(&self.offset);
        let today = local_now.date_naive();

        // Every weekday recurs within 8 days
        for days_ahead in 0..=7 {
            let date = today + Duration::days(days_ahead);
            if !self.weekdays.contains(&date.weekday()) {
                continue;
            }
            if let Some(candidate) = self.offset.from_local_datetime(&date.and_time(self.time)).single() {
                let candidate = candidate.with_timezone(&Utc);
                if candidate > now {
                    return candidate;
                }
            }
        }

        // Unreachable with a non-empty weekday list
        now + Duration::weeks(1)
    }
}

/// Drives rebuilds: bootstrap at startup, calendar in production, manual on demand.
pub struct RebuildScheduler {
    worker: Arc<DistributionWorker>,
    schedule: WeeklySchedule,
    calendar_enabled: bool,
    state: AtomicU8,
    clock: Clock,
}

impl RebuildScheduler {
    pub fn new(worker: Arc<DistributionWorker>, schedule: WeeklySchedule, calendar_enabled: bool) -> Self {
        Self {
            worker,
            schedule,
            calendar_enabled,
            state: AtomicU8::new(IDLE),
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock used to place calendar rebuilds
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> SchedulerState {
        match self.state.load(Ordering::SeqCst) {
            REBUILDING => SchedulerState::Rebuilding,
            _ => SchedulerState::Idle,
        }
    }

    /// Next calendar rebuild, or `None` when the calendar is off
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.calendar_enabled
            .then(|| self.schedule.next_fire_after((self.clock)()))
    }

    /// Run a rebuild unless one is already in flight
    pub async fn trigger(&self, source: TriggerSource) -> TriggerOutcome {
        if self
            .state
            .compare_exchange(IDLE, REBUILDING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("⏭️ {:?} rebuild skipped: a rebuild is already running", source);
            return TriggerOutcome::Skipped;
        }
        let _guard = RebuildGuard { state: &self.state };

        info!("⏰ {:?} rebuild triggered", source);
        match self.worker.run_rebuild().await {
            Ok(status) => TriggerOutcome::Completed(status),
            Err(e) => TriggerOutcome::Failed(e.to_string()),
        }
    }

    /// Either generation artifact is missing
    pub fn needs_bootstrap(&self) -> bool {
        !self.worker.store().has_bootstrap_artifacts()
    }

    /// Rebuild at startup when the store has never been populated
    pub async fn bootstrap(&self) -> Option<TriggerOutcome> {
        if !self.needs_bootstrap() {
            info!("📦 Distribution artifacts present, skipping bootstrap rebuild");
            return None;
        }
        info!("📦 Distribution artifacts missing, running bootstrap rebuild");
        Some(self.trigger(TriggerSource::Bootstrap).await)
    }

    /// Calendar loop. Returns when `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.calendar_enabled {
            info!("📅 Calendar rebuilds disabled outside production");
            return;
        }

        loop {
            let now = (self.clock)();
            let next = self.schedule.next_fire_after(now);
            info!("📅 Next scheduled rebuild at {}", next);

            let wait = (next - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    if let TriggerOutcome::Failed(reason) = self.trigger(TriggerSource::Calendar).await {
                        error!("Scheduled rebuild failed: {}", reason);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("🛑 Scheduler stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SnapshotStore;
    use crate::test_support::MockLedger;
    use crate::types::IndexerConfig;
    use tokio::sync::Notify;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn schedule(weekdays: &[&str], hour: u32, minute: u32, offset: i32) -> WeeklySchedule {
        WeeklySchedule::from_config(&ScheduleConfig {
            weekdays: weekdays.iter().map(|d| d.to_string()).collect(),
            hour,
            minute,
            utc_offset_minutes: offset,
        })
        .unwrap()
    }

    fn scheduler(ledger: MockLedger, dir: &std::path::Path) -> RebuildScheduler {
        build_scheduler(ledger, dir, false)
    }

    fn build_scheduler(ledger: MockLedger, dir: &std::path::Path, calendar_enabled: bool) -> RebuildScheduler {
        let mut config = IndexerConfig::default();
        config.storage.data_dir = dir.to_string_lossy().to_string();
        config.enumeration.anchor_account = MockLedger::ANCHOR.to_string();
        config.classification.batch_delay_ms = 0;
        config.retry.max_attempts = 1;

        let store = Arc::new(SnapshotStore::from_config(&config.storage).unwrap());
        let worker = Arc::new(DistributionWorker::new(&config, Arc::new(ledger), store));
        RebuildScheduler::new(
            worker,
            WeeklySchedule::from_config(&config.schedule).unwrap(),
            calendar_enabled,
        )
    }

    /// Clock that starts at `base` and follows tokio's (possibly paused) time
    fn tokio_clock(base: DateTime<Utc>) -> Clock {
        let started = tokio::time::Instant::now();
        Arc::new(move || base + Duration::from_std(started.elapsed()).unwrap())
    }

    #[test]
    fn test_next_fire_same_day() {
        // 2024-01-02 is a Tuesday
        let schedule = schedule(&["tue", "fri"], 5, 15, 0);
        assert_eq!(
            schedule.next_fire_after(utc("2024-01-02T01:00:00Z")),
            utc("2024-01-02T05:15:00Z")
        );
    }

    #[test]
    fn test_next_fire_skips_to_next_weekday() {
        let schedule = schedule(&["tue", "fri"], 5, 15, 0);
        assert_eq!(
            schedule.next_fire_after(utc("2024-01-02T05:15:00Z")),
            utc("2024-01-05T05:15:00Z")
        );
        assert_eq!(
            schedule.next_fire_after(utc("2024-01-05T06:00:00Z")),
            utc("2024-01-09T05:15:00Z")
        );
    }

    #[test]
    fn test_next_fire_respects_offset() {
        // 05:15 at +02:00 is 03:15 UTC
        let schedule = schedule(&["tue"], 5, 15, 120);
        assert_eq!(
            schedule.next_fire_after(utc("2024-01-02T03:00:00Z")),
            utc("2024-01-02T03:15:00Z")
        );
    }

    #[test]
    fn test_invalid_schedule_rejected() {
        let config = ScheduleConfig {
            weekdays: vec!["blursday".to_string()],
            hour: 5,
            minute: 15,
            utc_offset_minutes: 0,
        };
        assert!(WeeklySchedule::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(MockLedger::with_accounts(3), dir.path());

        assert!(scheduler.needs_bootstrap());
        let outcome = scheduler.bootstrap().await;
        assert!(matches!(outcome, Some(TriggerOutcome::Completed(_))));
        assert!(!scheduler.needs_bootstrap());
        assert!(scheduler.bootstrap().await.is_none());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let scheduler = Arc::new(scheduler(
            MockLedger::with_accounts(3).gate_count(Arc::clone(&gate)),
            dir.path(),
        ));

        let first = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.trigger(TriggerSource::Calendar).await })
        };

        while scheduler.state() != SchedulerState::Rebuilding {
            tokio::task::yield_now().await;
        }
        assert_eq!(scheduler.trigger(TriggerSource::Manual).await, TriggerOutcome::Skipped);

        gate.notify_one();
        assert!(matches!(first.await.unwrap(), TriggerOutcome::Completed(_)));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_failed_rebuild_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(MockLedger::with_accounts(3).fail_balances(), dir.path());

        let outcome = scheduler.trigger(TriggerSource::Manual).await;
        assert!(matches!(outcome, TriggerOutcome::Failed(_)));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(scheduler.needs_bootstrap());
    }

    #[tokio::test]
    async fn test_calendar_loop_disabled_returns() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(MockLedger::with_accounts(1), dir.path());
        assert_eq!(scheduler.next_fire(), None);
        let (_tx, rx) = watch::channel(false);
        scheduler.run(rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_calendar_loop_fires_at_schedule() {
        let dir = tempfile::tempdir().unwrap();
        // One minute before the Tuesday 05:15 UTC slot
        let scheduler = Arc::new(
            build_scheduler(MockLedger::with_accounts(3), dir.path(), true)
                .with_clock(tokio_clock(utc("2024-01-02T05:14:00Z"))),
        );
        assert_eq!(scheduler.next_fire(), Some(utc("2024-01-02T05:15:00Z")));

        let (tx, rx) = watch::channel(false);
        let handle = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run(rx).await })
        };

        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        assert!(!scheduler.worker.store().has_bootstrap_artifacts());

        for _ in 0..600 {
            if scheduler.worker.store().run_status().is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
        assert!(scheduler.worker.store().has_bootstrap_artifacts());
        assert_eq!(scheduler.worker.get_status().await.rebuilds_completed, 1);
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        // The following slot is Friday
        assert_eq!(scheduler.next_fire(), Some(utc("2024-01-05T05:15:00Z")));

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("calendar loop did not stop")
            .unwrap();
        assert_eq!(scheduler.worker.get_status().await.rebuilds_completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calendar_loop_stops_while_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(
            build_scheduler(MockLedger::with_accounts(3), dir.path(), true)
                .with_clock(tokio_clock(utc("2024-01-02T06:00:00Z"))),
        );

        let (tx, rx) = watch::channel(false);
        let handle = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run(rx).await })
        };

        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        assert!(!handle.is_finished());

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("calendar loop did not stop")
            .unwrap();
        assert!(!scheduler.worker.store().has_bootstrap_artifacts());
        assert_eq!(scheduler.worker.get_status().await.rebuilds_completed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calendar_loop_stops_when_sender_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = build_scheduler(MockLedger::with_accounts(1), dir.path(), true)
            .with_clock(tokio_clock(utc("2024-01-02T06:00:00Z")));

        let (tx, rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(std::time::Duration::from_secs(5), scheduler.run(rx))
            .await
            .expect("calendar loop did not stop");
    }
}
