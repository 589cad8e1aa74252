use std::time::Duration;

use lms_core::CalendarZone;
use lms_storage::BlobKind;
use tracing::warn;

pub const DEFAULT_PROGRESS_DEBOUNCE: Duration = Duration::from_millis(300);
pub const DEFAULT_SAVED_COURSES_DEBOUNCE: Duration = Duration::from_millis(500);

/// Tunables for a `ProgressStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Debounce window for progress, quiz result, rating and index blobs.
    pub progress_debounce: Duration,
    /// Debounce window for the saved-courses blob.
    pub saved_courses_debounce: Duration,
    /// Calendar used to bucket completions into days for streaks.
    pub calendar: CalendarZone,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            progress_debounce: DEFAULT_PROGRESS_DEBOUNCE,
            saved_courses_debounce: DEFAULT_SAVED_COURSES_DEBOUNCE,
            calendar: CalendarZone::Local,
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by `LMS_PROGRESS_DEBOUNCE_MS`, `LMS_SAVED_DEBOUNCE_MS`
    /// and `LMS_UTC_OFFSET_MINUTES`. Unparseable values are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(ms) = parse_var(&lookup, "LMS_PROGRESS_DEBOUNCE_MS", |v| v.parse::<u64>().ok())
        {
            config.progress_debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "LMS_SAVED_DEBOUNCE_MS", |v| v.parse::<u64>().ok()) {
            config.saved_courses_debounce = Duration::from_millis(ms);
        }
        if let Some(zone) = parse_var(&lookup, "LMS_UTC_OFFSET_MINUTES", |v| {
            v.parse::<i32>().ok().and_then(CalendarZone::from_offset_minutes)
        }) {
            config.calendar = zone;
        }
        config
    }

    /// Debounce window for a blob kind.
    #[must_use]
    pub fn debounce_for(&self, kind: BlobKind) -> Duration {
        match kind {
            BlobKind::SavedCourses => self.saved_courses_debounce,
            BlobKind::Progress | BlobKind::QuizResults | BlobKind::CourseRatings => {
                self.progress_debounce
            }
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Option<T> {
    let raw = lookup(name)?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        warn!(var = name, value = %raw, "ignoring invalid config value");
    }
    parsed
}
