use crate::error::{Error, Result};
use crate::util::ratio;
use crate::{LearnerId, SessionId, TaskId, WordId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Where a task's word list came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskSource {
    Unit,
    Smart,
}

impl TaskSource {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unit" => Some(TaskSource::Unit),
            "smart" => Some(TaskSource::Smart),
            _ => None,
        }
    }
}

/// Word snapshot captured when a task is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskWord {
    pub word_id: WordId,
    pub text: String,
}

/// Planned practice. The word list never changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictationTask {
    pub id: TaskId,
    pub learner_id: LearnerId,
    pub words: Vec<TaskWord>,
    pub source: TaskSource,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    InProgress,
    Completed,
    Interrupted,
}

impl SessionStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SessionStatus::Pending),
            "in_progress" => Some(SessionStatus::InProgress),
            "completed" => Some(SessionStatus::Completed),
            "interrupted" => Some(SessionStatus::Interrupted),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Interrupted)
    }
}

/// Result for one word of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictationDetail {
    pub word_id: WordId,
    pub expected_text: String,
    pub user_input: Option<String>,
    /// Unset until answered or until the session completes
    pub is_correct: Option<bool>,
    pub retry_count: u32,
    pub time_spent_secs: u32,
}

impl DictationDetail {
    fn stub(word: &TaskWord) -> Self {
        Self {
            word_id: word.word_id,
            expected_text: word.text.clone(),
            user_input: None,
            is_correct: None,
            retry_count: 0,
            time_spent_secs: 0,
        }
    }
}

/// Session-level aggregate returned by complete and interrupt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub total_words: u32,
    pub correct_count: u32,
    pub accuracy: f64,
    pub total_time_secs: i64,
}

/// Audit entry for a changed verdict on a completed session. The original
/// detail is left untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerCorrection {
    pub session_id: SessionId,
    pub word_id: WordId,
    pub previous_input: Option<String>,
    pub previous_correct: Option<bool>,
    pub corrected_input: String,
    pub corrected_correct: bool,
    pub reason: Option<String>,
    pub corrected_at: DateTime<Utc>,
}

/// Outcome of a completion request
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The session just completed; each outcome must be applied exactly once
    Finished {
        summary: SessionSummary,
        outcomes: Vec<(WordId, bool)>,
    },
    /// The session was already terminal; nothing to apply
    AlreadyTerminal(SessionSummary),
}

impl Completion {
    pub fn summary(&self) -> &SessionSummary {
        match self {
            Completion::Finished { summary, .. } | Completion::AlreadyTerminal(summary) => summary,
        }
    }
}

/// One attempt at a task: `pending -> in_progress -> {completed, interrupted}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictationSession {
    /// Zero until the session is persisted
    pub id: SessionId,
    pub task_id: TaskId,
    pub learner_id: LearnerId,
    pub status: SessionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub details: Vec<DictationDetail>,
    /// Stored aggregate once the session is terminal
    pub summary: Option<SessionSummary>,
}

impl DictationSession {
    /// A pending session with one unanswered detail per task word
    pub fn create(task: &DictationTask) -> Self {
        Self {
            id: 0,
            task_id: task.id,
            learner_id: task.learner_id,
            status: SessionStatus::Pending,
            start_time: None,
            end_time: None,
            details: task.words.iter().map(DictationDetail::stub).collect(),
            summary: None,
        }
    }

    fn invalid(&self, action: &'static str) -> Error {
        Error::InvalidTransition {
            session_id: self.id,
            from: self.status,
            action,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != SessionStatus::Pending {
            return Err(self.invalid("start"));
        }
        self.status = SessionStatus::InProgress;
        self.start_time = Some(now);
        Ok(())
    }

    /// Score an answer by exact match; a resubmission replaces the earlier
    /// answer, bumps the retry count and adds to the time spent.
    pub fn record_answer(
        &mut self,
        word_id: WordId,
        user_input: &str,
        time_spent_secs: u32,
    ) -> Result<&DictationDetail> {
        if self.status != SessionStatus::InProgress {
            return Err(self.invalid("record an answer for"));
        }
        let session_id = self.id;
        let detail = self
            .details
            .iter_mut()
            .find(|d| d.word_id == word_id)
            .ok_or(Error::WordNotInSession {
                session_id,
                word_id,
            })?;

        if detail.is_correct.is_some() {
            detail.retry_count += 1;
        }
        detail.is_correct = Some(user_input == detail.expected_text);
        detail.user_input = Some(user_input.to_string());
        detail.time_spent_secs = detail.time_spent_secs.saturating_add(time_spent_secs);
        Ok(detail)
    }

    /// Finish the session. Unanswered words count as incorrect. Calling this
    /// on a terminal session returns the stored summary and changes nothing.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<Completion> {
        match self.status {
            SessionStatus::Completed | SessionStatus::Interrupted => {
                return Ok(Completion::AlreadyTerminal(self.terminal_summary()))
            }
            SessionStatus::Pending => return Err(self.invalid("complete")),
            SessionStatus::InProgress => {}
        }

        for detail in self.details.iter_mut().filter(|d| d.is_correct.is_none()) {
            detail.is_correct = Some(false);
        }
        let summary = self.close(SessionStatus::Completed, now);

        let mut seen = HashSet::new();
        let outcomes = self
            .details
            .iter()
            .filter(|d| seen.insert(d.word_id))
            .map(|d| (d.word_id, d.is_correct == Some(true)))
            .collect();

        Ok(Completion::Finished { summary, outcomes })
    }

    /// Abandon the session. No learning signal is produced.
    pub fn interrupt(&mut self, now: DateTime<Utc>) -> Result<SessionSummary> {
        match self.status {
            SessionStatus::Completed | SessionStatus::Interrupted => Ok(self.terminal_summary()),
            SessionStatus::Pending => Err(self.invalid("interrupt")),
            SessionStatus::InProgress => Ok(self.close(SessionStatus::Interrupted, now)),
        }
    }

    fn close(&mut self, status: SessionStatus, now: DateTime<Utc>) -> SessionSummary {
        self.status = status;
        self.end_time = Some(now);
        let summary = self.compute_summary();
        self.summary = Some(summary.clone());
        summary
    }

    fn terminal_summary(&self) -> SessionSummary {
        self.summary.clone().unwrap_or_else(|| self.compute_summary())
    }

    fn compute_summary(&self) -> SessionSummary {
        let total_words = self.details.len() as u32;
        let correct_count = self
            .details
            .iter()
            .filter(|d| d.is_correct == Some(true))
            .count() as u32;
        let accuracy = ratio(correct_count, total_words);
        let total_time_secs = match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (end - start).num_seconds().max(0),
            _ => 0,
        };

        SessionSummary {
            session_id: self.id,
            status: self.status,
            total_words,
            correct_count,
            accuracy,
            total_time_secs,
        }
    }

    pub fn answered(&self) -> usize {
        self.details.iter().filter(|d| d.user_input.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 2, 19, 30, 0).unwrap()
    }

    fn task(texts: &[(WordId, &str)]) -> DictationTask {
        DictationTask {
            id: 4,
            learner_id: 9,
            words: texts
                .iter()
                .map(|(word_id, text)| TaskWord {
                    word_id: *word_id,
                    text: text.to_string(),
                })
                .collect(),
            source: TaskSource::Unit,
            created_at: t0(),
        }
    }

    fn started(texts: &[(WordId, &str)]) -> DictationSession {
        let mut session = DictationSession::create(&task(texts));
        session.id = 12;
        session.start(t0()).unwrap();
        session
    }

    #[test]
    fn test_create_materializes_stubs() {
        let session = DictationSession::create(&task(&[(1, "山"), (2, "水")]));
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.details.len(), 2);
        assert!(session.details.iter().all(|d| d.is_correct.is_none()));
        assert_eq!(session.details[1].expected_text, "水");
    }

    #[test]
    fn test_start_only_from_pending() {
        let mut session = started(&[(1, "山")]);
        assert_eq!(session.start_time, Some(t0()));
        assert_matches!(
            session.start(t0()),
            Err(Error::InvalidTransition { from: SessionStatus::InProgress, .. })
        );
    }

    #[test]
    fn test_record_answer_exact_match() {
        let mut session = started(&[(1, "山"), (2, "白云")]);

        assert_eq!(session.record_answer(1, "山", 3).unwrap().is_correct, Some(true));
        assert_eq!(session.record_answer(2, "白去", 4).unwrap().is_correct, Some(false));
        assert_eq!(session.record_answer(2, " 白云", 1).unwrap().is_correct, Some(false));
    }

    #[test]
    fn test_resubmission_overwrites_and_counts_retry() {
        let mut session = started(&[(1, "山")]);
        session.record_answer(1, "出", 5).unwrap();
        let detail = session.record_answer(1, "山", 2).unwrap();

        assert_eq!(detail.is_correct, Some(true));
        assert_eq!(detail.user_input.as_deref(), Some("山"));
        assert_eq!(detail.retry_count, 1);
        assert_eq!(detail.time_spent_secs, 7);
    }

    #[test]
    fn test_record_answer_rejects_unknown_word_and_wrong_state() {
        let mut session = started(&[(1, "山")]);
        assert_matches!(
            session.record_answer(99, "x", 1),
            Err(Error::WordNotInSession { session_id: 12, word_id: 99 })
        );

        session.complete(t0()).unwrap();
        assert_matches!(
            session.record_answer(1, "山", 1),
            Err(Error::InvalidTransition { from: SessionStatus::Completed, .. })
        );
    }

    #[test]
    fn test_complete_scores_unanswered_as_incorrect() {
        let mut session = started(&[(1, "山"), (2, "水"), (3, "田")]);
        session.record_answer(1, "山", 2).unwrap();
        session.record_answer(2, "木", 2).unwrap();

        let end = t0() + Duration::seconds(95);
        let completion = session.complete(end).unwrap();
        let Completion::Finished { summary, outcomes } = completion else {
            panic!("expected a fresh completion");
        };

        assert_eq!(summary.correct_count, 1);
        assert_eq!(summary.total_words, 3);
        assert!((summary.accuracy - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.total_time_secs, 95);
        assert_eq!(outcomes, vec![(1, true), (2, false), (3, false)]);
        assert!(session.details.iter().all(|d| d.is_correct.is_some()));
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[test]
    fn test_complete_twice_is_idempotent() {
        let mut session = started(&[(1, "山")]);
        session.record_answer(1, "山", 2).unwrap();

        let first = session.complete(t0() + Duration::seconds(10)).unwrap();
        let second = session.complete(t0() + Duration::seconds(99)).unwrap();

        assert_matches!(first, Completion::Finished { .. });
        assert_matches!(second, Completion::AlreadyTerminal(_));
        assert_eq!(first.summary(), second.summary());
    }

    #[test]
    fn test_duplicate_words_apply_first_occurrence_only() {
        let mut session = started(&[(1, "山"), (1, "山")]);
        session.record_answer(1, "山", 1).unwrap();

        let Completion::Finished { outcomes, .. } = session.complete(t0()).unwrap() else {
            panic!("expected a fresh completion");
        };
        assert_eq!(outcomes, vec![(1, true)]);
    }

    #[test]
    fn test_interrupt_produces_no_outcomes() {
        let mut session = started(&[(1, "山"), (2, "水")]);
        session.record_answer(1, "山", 1).unwrap();

        let summary = session.interrupt(t0() + Duration::seconds(30)).unwrap();
        assert_eq!(summary.status, SessionStatus::Interrupted);
        assert_eq!(summary.correct_count, 1);
        // unanswered items stay unset on an interrupted session
        assert_eq!(session.details[1].is_correct, None);

        // terminal: both requests are no-ops
        assert_matches!(session.complete(t0()).unwrap(), Completion::AlreadyTerminal(_));
        assert_eq!(session.interrupt(t0()).unwrap(), summary);
    }

    #[test]
    fn test_pending_session_cannot_finish() {
        let mut session = DictationSession::create(&task(&[(1, "山")]));
        assert_matches!(session.complete(t0()), Err(Error::InvalidTransition { .. }));
        assert_matches!(session.interrupt(t0()), Err(Error::InvalidTransition { .. }));
    }

    #[test]
    fn test_status_roundtrip_through_text() {
        for status in [
            SessionStatus::Pending,
            SessionStatus::InProgress,
            SessionStatus::Completed,
            SessionStatus::Interrupted,
        ] {
            assert_eq!(SessionStatus::parse(&status.to_string()), Some(status));
        }
        assert_eq!(TaskSource::parse("smart"), Some(TaskSource::Smart));
        assert_eq!(TaskSource::parse("bogus"), None);
    }
}
