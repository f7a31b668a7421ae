use crate::toggl::{Project, TimeEntry, TogglClient};
use crate::{Error, ProjectErrorPolicy, Result};
use async_trait::async_trait;
use chrono::{DateTime, Months, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinSet;

/// Trait that needs to be implemented by a source of time entries and projects.
#[async_trait]
pub trait TimeTracking: Send + Sync {
    /// Fetches all time entries within `range`.
    async fn fetch_entries(&self, range: Range<DateTime<Utc>>) -> Result<Vec<TimeEntry>>;

    /// Resolves a project by id. Returns `None` if it does not exist.
    async fn fetch_project(&self, workspace_id: i64, project_id: i64) -> Result<Option<Project>>;
}

#[async_trait]
impl TimeTracking for TogglClient {
    async fn fetch_entries(&self, range: Range<DateTime<Utc>>) -> Result<Vec<TimeEntry>> {
        Ok(self.get_time_entries(Some(range)).await?)
    }

    async fn fetch_project(&self, workspace_id: i64, project_id: i64) -> Result<Option<Project>> {
        Ok(self.get_project(workspace_id, project_id).await?)
    }
}

#[async_trait]
impl<T> TimeTracking for Arc<T>
where
    T: TimeTracking + ?Sized,
{
    async fn fetch_entries(&self, range: Range<DateTime<Utc>>) -> Result<Vec<TimeEntry>> {
        (**self).fetch_entries(range).await
    }

    async fn fetch_project(&self, workspace_id: i64, project_id: i64) -> Result<Option<Project>> {
        (**self).fetch_project(workspace_id, project_id).await
    }
}

/// A time entry joined with the project it references.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct EnrichedEntry {
    #[serde(flatten)]
    pub entry: TimeEntry,
    /// The resolved project, if the entry references one that exists.
    pub project: Option<Project>,
    /// Human readable duration, e.g. `1.5h`.
    pub duration_label: String,
}

impl EnrichedEntry {
    pub fn new(entry: TimeEntry, project: Option<Project>) -> EnrichedEntry {
        let duration_label = duration_label(entry.duration);

        EnrichedEntry {
            entry,
            project,
            duration_label,
        }
    }

    /// The name of the resolved project, or `n/a` if there is none.
    pub fn project_name(&self) -> &str {
        self.project
            .as_ref()
            .map(|project| project.name.as_str())
            .unwrap_or("n/a")
    }
}

/// The document served in JSON mode.
#[derive(Serialize, Debug)]
pub struct EntriesDocument<'a> {
    pub entries: &'a [EnrichedEntry],
}

impl EntriesDocument<'_> {
    /// Serializes the document as JSON indented by four spaces.
    pub fn to_json_pretty(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)?;
        Ok(buf)
    }
}

/// Formats a duration in seconds as hours rounded to one decimal, e.g. `1.5h`.
///
/// Durations that round to zero or below (including running entries) yield `n/a`.
pub fn duration_label(duration_secs: i64) -> String {
    let hours = (duration_secs as f64 / 3600.0 * 10.0).round() / 10.0;

    if hours > 0.0 {
        format!("{hours}h")
    } else {
        "n/a".to_owned()
    }
}

/// Returns the trailing window of `months` months ending at `now`.
pub fn lookback_range(now: DateTime<Utc>, months: u32) -> Range<DateTime<Utc>> {
    let start = now
        .checked_sub_months(Months::new(months))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    start..now
}

/// Outcome of a single project lookup, shared by every entry referencing the project.
type Lookup = std::result::Result<Option<Project>, Arc<Error>>;

/// Memoizes project lookups by id for the lifetime of a single request.
///
/// Concurrent lookups of the same id share one call to the underlying source. Failures are
/// memoized as well.
pub struct ProjectCache {
    source: Arc<dyn TimeTracking>,
    projects: Mutex<HashMap<i64, Arc<OnceCell<Lookup>>>>,
}

impl ProjectCache {
    pub fn new(source: Arc<dyn TimeTracking>) -> ProjectCache {
        ProjectCache {
            source,
            projects: Default::default(),
        }
    }

    /// Resolves a project, calling the source only on the first reference to `project_id`.
    pub async fn get(&self, workspace_id: i64, project_id: i64) -> Result<Option<Project>> {
        let cell = self
            .projects
            .lock()
            .await
            .entry(project_id)
            .or_default()
            .clone();

        let lookup = cell
            .get_or_init(|| async {
                self.source
                    .fetch_project(workspace_id, project_id)
                    .await
                    .map_err(Arc::new)
            })
            .await;

        lookup.clone().map_err(|source| Error::ProjectLookup { project_id, source })
    }

    /// Number of distinct project ids referenced so far.
    pub async fn distinct_ids(&self) -> usize {
        self.projects.lock().await.len()
    }
}

/// Joins each entry with its project. Lookups run concurrently; the output keeps the input order.
pub async fn enrich(
    entries: Vec<TimeEntry>,
    projects: Arc<ProjectCache>,
    policy: ProjectErrorPolicy,
) -> Result<Vec<EnrichedEntry>> {
    let mut slots: Vec<Option<EnrichedEntry>> = vec![None; entries.len()];
    let mut tasks = JoinSet::new();

    for (index, entry) in entries.into_iter().enumerate() {
        let projects = projects.clone();

        tasks.spawn(async move {
            let project = match entry.project_id {
                Some(project_id) => match projects.get(entry.workspace_id, project_id).await {
                    Ok(project) => project,
                    Err(err) if policy == ProjectErrorPolicy::Absent => {
                        log::warn!("{err}");
                        None
                    }
                    Err(err) => return Err(err),
                },
                None => None,
            };

            Ok::<_, Error>((index, EnrichedEntry::new(entry, project)))
        });
    }

    // Dropping the set on the first error aborts the remaining lookups.
    while let Some(result) = tasks.join_next().await {
        let (index, entry) = result??;
        slots[index] = Some(entry);
    }

    log::debug!("resolved {} distinct projects", projects.distinct_ids().await);

    Ok(slots.into_iter().flatten().collect())
}

/// The `Timesheet` type wraps a time tracking source with project resolution.
#[derive(Clone)]
pub struct Timesheet {
    source: Arc<dyn TimeTracking>,
    project_errors: ProjectErrorPolicy,
}

impl Timesheet {
    /// Creates a new `Timesheet` from a time tracking source.
    pub fn new<T>(source: T) -> Timesheet
    where
        T: TimeTracking + 'static,
    {
        Timesheet {
            source: Arc::new(source),
            project_errors: ProjectErrorPolicy::default(),
        }
    }

    /// Sets the behaviour for failed project lookups.
    pub fn with_project_errors(mut self, policy: ProjectErrorPolicy) -> Timesheet {
        self.project_errors = policy;
        self
    }

    /// Fetches the time entries within `range` and joins them with their projects.
    pub async fn get_entries(&self, range: Range<DateTime<Utc>>) -> Result<Vec<EnrichedEntry>> {
        let entries = self.source.fetch_entries(range).await?;
        let projects = Arc::new(ProjectCache::new(self.source.clone()));

        enrich(entries, projects, self.project_errors).await
    }
}
