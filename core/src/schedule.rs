use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::time::Duration;

use chrono::DateTime;
use chrono::Datelike;
use chrono::Timelike;
use chrono::Utc;
use pubdatahub_protocol::JobId;
use pubdatahub_protocol::JobStatus;
use tokio_util::task::AbortOnDropHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::CoreError;
use crate::JobManager;
use crate::Result;
use crate::jobs::Job;
use crate::jobs::ScheduledJobExecution;

/// Five-field cron expression: minute, hour, day-of-month, month,
/// day-of-week. Supports `*`, lists, ranges, and `/step` values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CronField {
    /// `*` with no step: matches every value.
    any: bool,
    values: BTreeSet<u8>,
}

impl CronField {
    fn matches(&self, value: u8) -> bool {
        self.any || self.values.contains(&value)
    }
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, day_of_month, month, day_of_week] = fields.as_slice() else {
            return Err(CoreError::validation(format!(
                "cron expression must have 5 fields, got {}: {expr:?}",
                fields.len()
            )));
        };
        Ok(Self {
            minute: parse_field(minute, 0, 59)?,
            hour: parse_field(hour, 0, 23)?,
            day_of_month: parse_field(day_of_month, 1, 31)?,
            month: parse_field(month, 1, 12)?,
            day_of_week: parse_field(day_of_week, 0, 6)?,
        })
    }

    /// Whether the minute containing `at` matches. Day-of-week runs 0–6
    /// with 0 = Sunday.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minute.matches(at.minute() as u8)
            && self.hour.matches(at.hour() as u8)
            && self.day_of_month.matches(at.day() as u8)
            && self.month.matches(at.month() as u8)
            && self
                .day_of_week
                .matches(at.weekday().num_days_from_sunday() as u8)
    }
}

fn parse_field(spec: &str, min: u8, max: u8) -> Result<CronField> {
    if spec == "*" {
        return Ok(CronField {
            any: true,
            values: BTreeSet::new(),
        });
    }
    let mut values = BTreeSet::new();
    for part in spec.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u8 = step.parse().map_err(|_| bad_field(spec))?;
                if step == 0 {
                    return Err(bad_field(spec));
                }
                (range, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (
                lo.parse().map_err(|_| bad_field(spec))?,
                hi.parse().map_err(|_| bad_field(spec))?,
            )
        } else {
            let value: u8 = range.parse().map_err(|_| bad_field(spec))?;
            (value, value)
        };
        if lo < min || hi > max || lo > hi {
            return Err(bad_field(spec));
        }
        let mut value = lo;
        while value <= hi {
            values.insert(value);
            match value.checked_add(step) {
                Some(next) => value = next,
                None => break,
            }
        }
    }
    Ok(CronField { any: false, values })
}

fn bad_field(spec: &str) -> CoreError {
    CoreError::validation(format!("invalid cron field: {spec:?}"))
}

/// One named schedule: an expression, a job factory, and the entries that
/// must have completed for a tick to fire.
pub struct ScheduleEntry {
    pub name: String,
    pub expr: CronExpr,
    pub depends_on: Vec<String>,
    builder: Arc<dyn Fn() -> Arc<dyn Job> + Send + Sync>,
}

impl ScheduleEntry {
    pub fn new(
        name: impl Into<String>,
        expr: CronExpr,
        builder: impl Fn() -> Arc<dyn Job> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            expr,
            depends_on: Vec::new(),
            builder: Arc::new(builder),
        }
    }

    pub fn with_dependencies(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }
}

/// Minute-granularity scheduler submitting [`ScheduledJobExecution`]s.
pub struct JobScheduler {
    manager: JobManager,
    entries: StdMutex<Vec<ScheduleEntry>>,
    last_runs: StdMutex<HashMap<String, JobId>>,
}

impl JobScheduler {
    pub fn new(manager: JobManager) -> Self {
        Self {
            manager,
            entries: StdMutex::new(Vec::new()),
            last_runs: StdMutex::new(HashMap::new()),
        }
    }

    /// Insert an entry. Duplicate names and dependency cycles are rejected;
    /// dependencies may name entries that are added later.
    pub fn add(&self, entry: ScheduleEntry) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.iter().any(|existing| existing.name == entry.name) {
            return Err(CoreError::validation(format!(
                "duplicate schedule entry: {}",
                entry.name
            )));
        }
        if entry.depends_on.contains(&entry.name) {
            return Err(CoreError::validation(format!(
                "schedule entry {} depends on itself",
                entry.name
            )));
        }
        entries.push(entry);
        if let Some(cycle_member) = find_cycle(&entries) {
            let rejected = entries
                .pop()
                .map(|entry| entry.name)
                .unwrap_or_default();
            return Err(CoreError::validation(format!(
                "schedule entry {rejected} creates a dependency cycle through {cycle_member}"
            )));
        }
        Ok(())
    }

    /// Evaluate every entry against `at`, submitting those that match and
    /// whose dependencies all completed. Returns the submitted job ids.
    pub async fn tick(&self, at: DateTime<Utc>) -> Vec<JobId> {
        let due: Vec<(String, Vec<String>, Arc<dyn Fn() -> Arc<dyn Job> + Send + Sync>)> = {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .filter(|entry| entry.expr.matches(at))
                .map(|entry| {
                    (
                        entry.name.clone(),
                        entry.depends_on.clone(),
                        Arc::clone(&entry.builder),
                    )
                })
                .collect()
        };
        let mut submitted = Vec::new();
        for (name, depends_on, builder) in due {
            if !self.dependencies_completed(&depends_on) {
                debug!(entry = name, "skipping tick, dependencies not completed");
                continue;
            }
            let job: Arc<dyn Job> = Arc::new(ScheduledJobExecution::new(name.as_str(), builder()));
            match self.manager.submit(job) {
                Ok(id) => {
                    info!(entry = name, %id, "scheduled job submitted");
                    self.last_runs
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(name, id);
                    submitted.push(id);
                }
                Err(err) => warn!(entry = name, "scheduled submission failed: {err}"),
            }
        }
        submitted
    }

    fn dependencies_completed(&self, depends_on: &[String]) -> bool {
        if depends_on.is_empty() {
            return true;
        }
        let last_runs = self
            .last_runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        depends_on.iter().all(|dep| {
            last_runs
                .get(dep)
                .and_then(|id| self.manager.get(*id).ok())
                .is_some_and(|info| info.status == JobStatus::Completed)
        })
    }

    /// Run the minute loop until dropped.
    pub fn spawn(self: Arc<Self>) -> AbortOnDropHandle<()> {
        AbortOnDropHandle::new(tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let until_next_minute = 60 - u64::from(now.second()).min(59);
                tokio::time::sleep(Duration::from_secs(until_next_minute)).await;
                self.tick(Utc::now()).await;
            }
        }))
    }
}

/// Name of some entry participating in a cycle, if one exists.
fn find_cycle(entries: &[ScheduleEntry]) -> Option<String> {
    let graph: HashMap<&str, &Vec<String>> = entries
        .iter()
        .map(|entry| (entry.name.as_str(), &entry.depends_on))
        .collect();
    let mut done: HashSet<&str> = HashSet::new();
    for entry in entries {
        let mut path: Vec<&str> = Vec::new();
        if walk(entry.name.as_str(), &graph, &mut done, &mut path) {
            return path.last().map(|name| (*name).to_string());
        }
    }
    None
}

fn walk<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, &'a Vec<String>>,
    done: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> bool {
    if done.contains(node) {
        return false;
    }
    if path.contains(&node) {
        path.push(node);
        return true;
    }
    path.push(node);
    if let Some(deps) = graph.get(node) {
        for dep in deps.iter() {
            if let Some((name, _)) = graph.get_key_value(dep.as_str())
                && walk(name, graph, done, path)
            {
                return true;
            }
        }
    }
    path.pop();
    done.insert(node);
    false
}
