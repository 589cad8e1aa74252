//! Read-only course structure provided by the CMS.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use lms_core::model::{CourseId, CourseTotals, LessonId, QuizId};

use crate::error::CatalogError;

/// Shape of one course: which lessons and quizzes count toward completion.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseOutline {
    pub course_id: CourseId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub lesson_ids: Vec<LessonId>,
    #[serde(default)]
    pub quiz_ids: Vec<QuizId>,
}

impl CourseOutline {
    #[must_use]
    pub fn totals(&self) -> CourseTotals {
        CourseTotals::new(count(self.lesson_ids.len()), count(self.quiz_ids.len()))
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[async_trait]
pub trait CourseCatalog: Send + Sync {
    /// Every published course.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError` if the catalog cannot be read.
    async fn courses(&self) -> Result<Vec<CourseOutline>, CatalogError>;

    /// One course by id, `None` if unknown.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError` if the catalog cannot be read.
    async fn course(&self, course_id: &CourseId) -> Result<Option<CourseOutline>, CatalogError> {
        Ok(self
            .courses()
            .await?
            .into_iter()
            .find(|c| &c.course_id == course_id))
    }
}

/// Fixed in-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    courses: Arc<BTreeMap<CourseId, CourseOutline>>,
}

impl StaticCatalog {
    #[must_use]
    pub fn new(courses: impl IntoIterator<Item = CourseOutline>) -> Self {
        Self {
            courses: Arc::new(
                courses
                    .into_iter()
                    .map(|c| (c.course_id.clone(), c))
                    .collect(),
            ),
        }
    }

    /// Parse a JSON array of course outlines.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::Malformed` if `raw` is not a valid outline array.
    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let courses: Vec<CourseOutline> = serde_json::from_str(raw)?;
        Ok(Self::new(courses))
    }
}

#[async_trait]
impl CourseCatalog for StaticCatalog {
    async fn courses(&self) -> Result<Vec<CourseOutline>, CatalogError> {
        Ok(self.courses.values().cloned().collect())
    }

    async fn course(&self, course_id: &CourseId) -> Result<Option<CourseOutline>, CatalogError> {
        Ok(self.courses.get(course_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_json_outlines() {
        let catalog = StaticCatalog::from_json(
            r#"[{"courseId":"rust-101","title":"Rust","lessonIds":["l1","l2","l3"],"quizIds":["q1"]},
                {"courseId":"empty"}]"#,
        )
        .unwrap();

        let rust = catalog
            .course(&CourseId::new("rust-101").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rust.totals(), CourseTotals::new(3, 1));

        let empty = catalog
            .course(&CourseId::new("empty").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(empty.totals().is_empty());
        assert_eq!(catalog.courses().await.unwrap().len(), 2);
    }

    #[test]
    fn blank_ids_are_rejected() {
        let err = StaticCatalog::from_json(r#"[{"courseId":"  "}]"#).unwrap_err();
        assert!(matches!(err, CatalogError::Malformed(_)));
    }
}
