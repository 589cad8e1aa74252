use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RecordError;
use crate::model::ids::{CourseId, QuestionId, QuizId};

/// Answer given to a single quiz question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Answer {
    /// Index of the selected option.
    Choice(u32),
    /// Free-form answer text.
    Text(String),
}

/// Outcome of one quiz attempt. At most one is kept per `(course_id, quiz_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuizResult {
    course_id: CourseId,
    quiz_id: QuizId,
    score: u8,
    total_questions: u32,
    completed_at: DateTime<Utc>,
    answers: BTreeMap<QuestionId, Answer>,
}

impl QuizResult {
    /// Build a validated quiz result.
    ///
    /// # Errors
    ///
    /// Returns `RecordError::InvalidScore` if `score` is above 100 and
    /// `RecordError::NoQuestions` if `total_questions` is zero.
    pub fn new(
        course_id: CourseId,
        quiz_id: QuizId,
        score: u8,
        total_questions: u32,
        completed_at: DateTime<Utc>,
        answers: BTreeMap<QuestionId, Answer>,
    ) -> Result<Self, RecordError> {
        if score > 100 {
            return Err(RecordError::InvalidScore(score));
        }
        if total_questions == 0 {
            return Err(RecordError::NoQuestions);
        }
        Ok(Self {
            course_id,
            quiz_id,
            score,
            total_questions,
            completed_at,
            answers,
        })
    }

    #[must_use]
    pub fn course_id(&self) -> &CourseId {
        &self.course_id
    }

    #[must_use]
    pub fn quiz_id(&self) -> &QuizId {
        &self.quiz_id
    }

    /// Percentage score in `0..=100`.
    #[must_use]
    pub fn score(&self) -> u8 {
        self.score
    }

    #[must_use]
    pub fn total_questions(&self) -> u32 {
        self.total_questions
    }

    #[must_use]
    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    #[must_use]
    pub fn answers(&self) -> &BTreeMap<QuestionId, Answer> {
        &self.answers
    }

    /// Map key: `(course_id, quiz_id)`.
    #[must_use]
    pub fn key(&self) -> (CourseId, QuizId) {
        (self.course_id.clone(), self.quiz_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;

    fn ids() -> (CourseId, QuizId) {
        (CourseId::new("c1").unwrap(), QuizId::new("q1").unwrap())
    }

    #[test]
    fn score_above_hundred_is_rejected() {
        let (course, quiz) = ids();
        let err = QuizResult::new(course, quiz, 101, 5, fixed_now(), BTreeMap::new()).unwrap_err();
        assert_eq!(err, RecordError::InvalidScore(101));
    }

    #[test]
    fn zero_questions_is_rejected() {
        let (course, quiz) = ids();
        let err = QuizResult::new(course, quiz, 80, 0, fixed_now(), BTreeMap::new()).unwrap_err();
        assert_eq!(err, RecordError::NoQuestions);
    }

    #[test]
    fn answers_keep_both_shapes() {
        let (course, quiz) = ids();
        let mut answers = BTreeMap::new();
        answers.insert(QuestionId::new("a").unwrap(), Answer::Choice(2));
        answers.insert(QuestionId::new("b").unwrap(), Answer::Text("borrowck".into()));
        let result = QuizResult::new(course, quiz, 100, 2, fixed_now(), answers).unwrap();

        let json = serde_json::to_string(result.answers()).unwrap();
        assert_eq!(json, r#"{"a":2,"b":"borrowck"}"#);
    }
}
