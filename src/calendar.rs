//! Mapping of enriched time entries to iCalendar events.

use crate::entries::EnrichedEntry;
use crate::CalendarConfig;
use chrono::{DateTime, Duration, Timelike, Utc};
use icalendar::{Calendar, Component, EventLike};

/// Delimiter between the summary and the task reference in an entry description.
const TASK_DELIMITER: &str = " |";

/// A calendar event derived from a single time entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    pub uid: String,
    pub start: DateTime<Utc>,
    /// `None` for entries that are still running.
    pub end: Option<DateTime<Utc>>,
    pub summary: String,
    pub description: String,
    pub location: String,
}

impl CalendarEvent {
    fn to_ical(&self) -> icalendar::Event {
        let mut event = icalendar::Event::new();
        event
            .uid(&self.uid)
            .starts(self.start)
            .summary(&self.summary);

        if let Some(end) = self.end {
            event.ends(end);
        }

        if !self.description.is_empty() {
            event.description(&self.description);
        }

        if !self.location.is_empty() {
            event.location(&self.location);
        }

        event.done()
    }
}

/// Splits an entry description into the event summary and its location URL.
///
/// `Write report | 42` becomes (`Write report`, `<prefix> 42`). Without a delimiter the location
/// is empty.
pub fn parse_description(description: Option<&str>, location_prefix: &str) -> (String, String) {
    let Some(description) = description else {
        return (String::new(), String::new());
    };

    let mut parts = description.split(TASK_DELIMITER);
    let summary = parts.next().unwrap_or_default().to_owned();
    let location = parts
        .next()
        .map(|task| format!("{location_prefix}{task}"))
        .unwrap_or_default();

    (summary, location)
}

/// Renders tags as `#tag` lines, each preceded by a newline.
pub fn render_tags(tags: &[String]) -> String {
    tags.iter().map(|tag| format!("\n #{tag}")).collect()
}

/// Event start: one minute after the entry start, truncated to the minute.
pub fn event_start(start: DateTime<Utc>) -> DateTime<Utc> {
    let start = start + Duration::minutes(1);

    start
        .with_second(0)
        .and_then(|start| start.with_nanosecond(0))
        .unwrap_or(start)
}

/// Maps the entries whose project name equals `workspace` to calendar events.
///
/// Entries without a project only match the name `n/a`.
pub fn events_for_workspace(
    entries: &[EnrichedEntry],
    workspace: &str,
    config: &CalendarConfig,
) -> Vec<CalendarEvent> {
    entries
        .iter()
        .filter(|enriched| enriched.project_name() == workspace)
        .map(|enriched| {
            let entry = &enriched.entry;
            let (summary, location) =
                parse_description(entry.description.as_deref(), &config.location_prefix);

            CalendarEvent {
                uid: format!("{}@{}", entry.id, config.domain),
                start: event_start(entry.start),
                end: entry.stop,
                summary,
                description: render_tags(entry.tags.as_deref().unwrap_or_default()),
                location,
            }
        })
        .collect()
}

/// Builds the calendar document for a workspace.
pub fn build_calendar(
    entries: &[EnrichedEntry],
    workspace: &str,
    config: &CalendarConfig,
) -> Calendar {
    let mut calendar = Calendar::new();
    calendar.name(&config.name);

    for event in events_for_workspace(entries, workspace, config) {
        calendar.push(event.to_ical());
    }

    calendar.done()
}
