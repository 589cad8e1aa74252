use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::ids::CourseId;

/// Courses a user bookmarked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SavedCourses(BTreeSet<CourseId>);

impl SavedCourses {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip membership of `course_id`. Returns `true` if it is now saved.
    pub fn toggle(&mut self, course_id: CourseId) -> bool {
        if self.0.remove(&course_id) {
            false
        } else {
            self.0.insert(course_id);
            true
        }
    }

    #[must_use]
    pub fn contains(&self, course_id: &CourseId) -> bool {
        self.0.contains(course_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CourseId> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<CourseId> for SavedCourses {
    fn from_iter<I: IntoIterator<Item = CourseId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
