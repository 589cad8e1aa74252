use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::course_progress::CourseTotals;
use crate::model::ids::{CourseId, Identity};

/// Per-course counters for one identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseActivity {
    pub lessons_completed: u32,
    pub quizzes_completed: u32,
}

impl CourseActivity {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lessons_completed == 0 && self.quizzes_completed == 0
    }

    #[must_use]
    pub fn matches(&self, totals: CourseTotals) -> bool {
        self.lessons_completed == totals.lessons && self.quizzes_completed == totals.quizzes
    }
}

/// What one identity has done on this device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityActivity {
    #[serde(default)]
    pub courses: BTreeMap<CourseId, CourseActivity>,
    #[serde(default)]
    pub completion_days: BTreeSet<NaiveDate>,
}

impl IdentityActivity {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.completion_days.is_empty() && self.courses.values().all(CourseActivity::is_empty)
    }
}

/// Device-wide table of every identity that recorded progress here.
///
/// Updated incrementally whenever the active identity mutates its records, so
/// cross-identity questions never need to enumerate storage keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityIndex {
    identities: BTreeMap<Identity, IdentityActivity>,
}

impl ActivityIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry for `identity`. Empty activity removes it.
    pub fn replace(&mut self, identity: Identity, activity: IdentityActivity) {
        if activity.is_empty() {
            self.identities.remove(&identity);
        } else {
            self.identities.insert(identity, activity);
        }
    }

    #[must_use]
    pub fn get(&self, identity: &Identity) -> Option<&IdentityActivity> {
        self.identities.get(identity)
    }

    pub fn identities(&self) -> impl Iterator<Item = (&Identity, &IdentityActivity)> {
        self.identities.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Union of completion days across every identity.
    #[must_use]
    pub fn all_completion_days(&self) -> BTreeSet<NaiveDate> {
        self.identities
            .values()
            .flat_map(|a| a.completion_days.iter().copied())
            .collect()
    }

    /// Identities with activity on `course_id` matching `totals` exactly, or
    /// with any activity when `totals` is `None`.
    #[must_use]
    pub fn count_finishers(&self, course_id: &CourseId, totals: Option<CourseTotals>) -> usize {
        self.identities
            .values()
            .filter_map(|a| a.courses.get(course_id))
            .filter(|c| match totals {
                Some(t) => c.matches(t),
                None => !c.is_empty(),
            })
            .count()
    }
}
