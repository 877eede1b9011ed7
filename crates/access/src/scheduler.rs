//! Job scheduler with an injectable clock
//!
//! The scheduler owns a registry of jobs, each with a daily wall-clock
//! schedule in an IANA timezone or a fixed interval. `start()` spawns a tick
//! loop that calls [`Scheduler::run_pending`]; tests instead drive a
//! [`ManualClock`] and call `run_pending()` directly.
//!
//! Every job runs on its own task. Errors and panics are logged and never
//! stop the scheduler.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Days, LocalResult, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{AccessError, AccessResult};

pub const DEFAULT_TICK: Duration = Duration::from_secs(30);

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|g| *g).unwrap_or_else(|_| Utc::now())
    }
}

/// Once a day at `hour:00` local time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    pub hour: u32,
    pub timezone: Tz,
}

impl DailySchedule {
    pub fn new(hour: u32, timezone: Tz) -> AccessResult<Self> {
        if hour > 23 {
            return Err(AccessError::Scheduler(format!(
                "hour must be 0-23, got {}",
                hour
            )));
        }
        Ok(Self { hour, timezone })
    }

    /// Six-field cron expression (`sec min hour dom mon dow`), in `timezone`
    pub fn cron_expression(&self) -> String {
        format!("0 0 {} * * *", self.hour)
    }

    /// First firing strictly after `after`.
    ///
    /// A local hour skipped by a DST jump fires at the first instant after
    /// the gap; a repeated hour fires on its first occurrence.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let local_date = after.with_timezone(&self.timezone).date_naive();
        let Some(fire_time) = NaiveTime::from_hms_opt(self.hour, 0, 0) else {
            return after + chrono::Duration::days(1);
        };

        for offset in 0..=2 {
            let Some(date) = local_date.checked_add_days(Days::new(offset)) else {
                continue;
            };
            let naive = date.and_time(fire_time);
            let candidate = match self.timezone.from_local_datetime(&naive) {
                LocalResult::Single(t) => t,
                LocalResult::Ambiguous(earliest, _) => earliest,
                LocalResult::None => {
                    match self
                        .timezone
                        .from_local_datetime(&(naive + chrono::Duration::hours(1)))
                        .earliest()
                    {
                        Some(t) => t,
                        None => continue,
                    }
                }
            };
            let candidate = candidate.with_timezone(&Utc);
            if candidate > after {
                return candidate;
            }
        }
        after + chrono::Duration::days(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Daily(DailySchedule),
    Every(Duration),
}

impl Schedule {
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::Daily(daily) => daily.next_fire_after(after),
            Schedule::Every(interval) => {
                after + chrono::Duration::from_std(*interval).unwrap_or(chrono::Duration::hours(1))
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Schedule::Daily(daily) => {
                format!("cron '{}' ({})", daily.cron_expression(), daily.timezone)
            }
            Schedule::Every(interval) => format!("every {}s", interval.as_secs()),
        }
    }
}

#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> AccessResult<()>;
}

struct Entry {
    job: Arc<dyn ScheduledJob>,
    schedule: Schedule,
    next_run: DateTime<Utc>,
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    entries: Arc<Mutex<Vec<Entry>>>,
    running: Arc<tokio::sync::Mutex<Option<Running>>>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(tokio::sync::Mutex::new(None)),
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    fn lock_entries(&self) -> AccessResult<std::sync::MutexGuard<'_, Vec<Entry>>> {
        self.entries
            .lock()
            .map_err(|_| AccessError::Scheduler("job registry poisoned".to_string()))
    }

    /// Add a job; returns its first firing time
    pub fn register(
        &self,
        job: Arc<dyn ScheduledJob>,
        schedule: Schedule,
    ) -> AccessResult<DateTime<Utc>> {
        let next_run = schedule.next_after(self.clock.now());
        tracing::info!(
            job = job.name(),
            schedule = %schedule.describe(),
            next_run = %next_run,
            "Scheduled job registered"
        );
        self.lock_entries()?.push(Entry {
            job,
            schedule,
            next_run,
        });
        Ok(next_run)
    }

    pub fn next_runs(&self) -> Vec<(String, DateTime<Utc>)> {
        self.lock_entries()
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| (e.job.name().to_string(), e.next_run))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Run every job that is due at the clock's current time, in
    /// registration order. Returns how many jobs ran.
    pub async fn run_pending(&self) -> usize {
        let now = self.clock.now();
        let due: Vec<Arc<dyn ScheduledJob>> = match self.lock_entries() {
            Ok(mut entries) => entries
                .iter_mut()
                .filter(|e| e.next_run <= now)
                .map(|e| {
                    e.next_run = e.schedule.next_after(now);
                    e.job.clone()
                })
                .collect(),
            Err(e) => {
                tracing::error!(error = %e, "Cannot read job registry");
                return 0;
            }
        };

        for job in &due {
            let name = job.name().to_string();
            let job = job.clone();
            tracing::debug!(job = %name, "Running scheduled job");
            match tokio::spawn(async move { job.run().await }).await {
                Ok(Ok(())) => tracing::debug!(job = %name, "Scheduled job finished"),
                Ok(Err(e)) => tracing::error!(job = %name, error = %e, "Scheduled job failed"),
                Err(e) => tracing::error!(job = %name, error = %e, "Scheduled job panicked"),
            }
        }
        due.len()
    }

    /// Spawn the tick loop. Calling `start` twice is a no-op.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }

        let (stop, mut stopped) = watch::channel(false);
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        scheduler.run_pending().await;
                    }
                    _ = stopped.changed() => break,
                }
            }
        });

        tracing::info!(tick_secs = self.tick.as_secs(), "Scheduler started");
        *running = Some(Running { stop, handle });
    }

    /// Stop the tick loop, letting a job already running finish
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.stop.send(true);
        if let Err(e) = running.handle.await {
            tracing::error!(error = %e, "Scheduler loop ended abnormally");
        }
        tracing::info!("Scheduler stopped");
    }
}
