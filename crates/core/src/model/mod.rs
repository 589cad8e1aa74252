mod activity;
mod comment;
mod course_progress;
mod ids;
mod lesson;
mod quiz;
mod rating;
mod saved;

pub use ids::{CommentId, CourseId, Identity, LessonId, QuestionId, QuizId, UserId};

pub use activity::{ActivityIndex, CourseActivity, IdentityActivity};
pub use comment::{COMMENT_MAX_CHARS, Comment};
pub use course_progress::{Completion, CourseProgress, CourseTotals};
pub use lesson::LessonProgress;
pub use quiz::{Answer, QuizResult};
pub use rating::{CourseRating, Rating};
pub use saved::SavedCourses;
