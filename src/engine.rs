use crate::catalog::{Catalog, CatalogCache, CatalogScope};
use crate::clock::Clock;
use crate::config::{Config, DEFAULT_BLEND_UNIT_SHARE};
use crate::error::{Error, Result};
use crate::mastery::{apply_outcome, IntervalTable, MasteryRepository, WordMasteryState};
use crate::selector::{self, SelectionFilter, SelectionMode, SelectionPool};
use crate::session::{
    AnswerCorrection, Completion, DictationDetail, DictationSession, DictationTask,
    SessionStatus, SessionSummary, TaskSource, TaskWord,
};
use crate::stats::{self, DateRange, ErrorPatterns, KindProgress, Overview, UnitErrorRow};
use crate::store::{self, Store};
use crate::{LearnerId, SessionId, TaskId, WordId};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use rand::RngCore;
use rusqlite::Connection;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Entry point for dictation practice: picks words, runs sessions and keeps
/// per-learner mastery up to date.
///
/// Every mutating call is one SQLite transaction, so the engine can be shared
/// across threads behind an `Arc`.
pub struct DictationEngine {
    store: Store,
    catalog: CatalogCache,
    intervals: IntervalTable,
    blend_unit_share: f64,
    clock: Arc<dyn Clock>,
}

impl DictationEngine {
    pub fn new(store: Store, catalog: Arc<dyn Catalog>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            catalog: CatalogCache::new(catalog),
            intervals: IntervalTable::default(),
            blend_unit_share: DEFAULT_BLEND_UNIT_SHARE,
            clock,
        }
    }

    pub fn from_config(
        config: &Config,
        store: Store,
        catalog: Arc<dyn Catalog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(store, catalog, clock)
            .with_intervals(config.interval_table()?)
            .with_blend_unit_share(config.blend_unit_share)?)
    }

    pub fn with_intervals(mut self, intervals: IntervalTable) -> Self {
        self.intervals = intervals;
        self
    }

    pub fn with_blend_unit_share(mut self, share: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&share) {
            return Err(Error::InvalidConfig(format!(
                "blend unit share must be within 0..=1, got {share}"
            )));
        }
        self.blend_unit_share = share;
        Ok(self)
    }

    /// The catalog cache, e.g. to invalidate a scope after an import
    pub fn catalog(&self) -> &CatalogCache {
        &self.catalog
    }

    pub fn intervals(&self) -> &IntervalTable {
        &self.intervals
    }

    // ---- selection ----

    pub fn select_review_words(
        &self,
        learner_id: LearnerId,
        scope: &CatalogScope,
        mode: &SelectionMode,
        count: usize,
    ) -> Result<Vec<WordId>> {
        let mut rng = rand::thread_rng();
        self.select_review_words_with_rng(learner_id, scope, mode, count, &mut rng)
    }

    /// Same as [`Self::select_review_words`] with a caller supplied RNG, so a
    /// seeded generator reproduces the draw.
    pub fn select_review_words_with_rng(
        &self,
        learner_id: LearnerId,
        scope: &CatalogScope,
        mode: &SelectionMode,
        count: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<WordId>> {
        let filter = SelectionFilter::default();
        self.select_filtered_words_with_rng(learner_id, scope, mode, &filter, count, rng)
    }

    /// Selection over the part of the scope that passes `filter`
    pub fn select_filtered_words_with_rng(
        &self,
        learner_id: LearnerId,
        scope: &CatalogScope,
        mode: &SelectionMode,
        filter: &SelectionFilter,
        count: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<WordId>> {
        let words = self.catalog.scope_words(scope);
        if words.is_empty() || count == 0 {
            debug!(learner_id, %scope, "nothing to review");
            return Ok(Vec::new());
        }

        let word_ids: Vec<WordId> = words.iter().map(|w| w.word_id).collect();
        let states = self
            .store
            .read(|conn| conn.load_mastery_states(learner_id, &word_ids))?;

        let filtered;
        let words = if filter.is_empty() {
            words.as_slice()
        } else {
            filtered = filter.apply(&words, &states);
            debug!(learner_id, ?filter, kept = filtered.len(), of = words.len(), "scope filtered");
            filtered.as_slice()
        };

        let pool = SelectionPool {
            words,
            states: &states,
            now: self.clock.now(),
        };
        let selected = selector::select(&pool, mode, count, self.blend_unit_share, rng);
        debug!(learner_id, %scope, ?mode, requested = count, selected = selected.len(), "words selected");
        Ok(selected)
    }

    // ---- tasks ----

    /// Freeze a word list into a task. Repeated ids keep their first position.
    pub fn create_task(
        &self,
        learner_id: LearnerId,
        word_ids: &[WordId],
        source: TaskSource,
    ) -> Result<TaskId> {
        let words = word_ids
            .iter()
            .unique()
            .map(|&word_id| {
                self.catalog
                    .word(word_id)
                    .map(|w| TaskWord {
                        word_id,
                        text: w.text,
                    })
                    .ok_or(Error::WordNotFound(word_id))
            })
            .collect::<Result<Vec<_>>>()?;

        let now = self.clock.now();
        let task = self
            .store
            .transaction(|tx| store::insert_task(tx, learner_id, &words, source, now))?;
        info!(task_id = task.id, learner_id, words = task.words.len(), %source, "task created");
        Ok(task.id)
    }

    pub fn task(&self, task_id: TaskId) -> Result<DictationTask> {
        self.store
            .read(|conn| store::load_task(conn, task_id))?
            .ok_or(Error::TaskNotFound(task_id))
    }

    // ---- sessions ----

    /// A new `pending` session for the task
    pub fn create_session(&self, task_id: TaskId) -> Result<SessionId> {
        let session = self.store.transaction(|tx| {
            let task = store::load_task(tx, task_id)?.ok_or(Error::TaskNotFound(task_id))?;
            let mut session = DictationSession::create(&task);
            store::insert_session(tx, &mut session)?;
            Ok(session)
        })?;
        info!(session_id = session.id, task_id, "session created");
        Ok(session.id)
    }

    /// Move a `pending` session to `in_progress`
    pub fn start_pending(&self, session_id: SessionId) -> Result<DictationSession> {
        let now = self.clock.now();
        let session = self.store.transaction(|tx| {
            let mut session = load_session(tx, session_id)?;
            session.start(now)?;
            if let Some(active) = store::active_session_id(tx, session.task_id)? {
                return Err(conflict(session.task_id, active));
            }
            store::update_session(tx, &session)
                .map_err(|err| map_conflict(tx, session.task_id, err))?;
            Ok(session)
        });
        let session = session.inspect_err(|err| warn!(session_id, %err, "start rejected"))?;
        info!(session_id, task_id = session.task_id, "session started");
        Ok(session)
    }

    /// Create and start a session for the task in one step.
    ///
    /// Fails with [`Error::SessionConflict`] while another session of the
    /// same task is in progress.
    pub fn start_session(&self, task_id: TaskId) -> Result<SessionId> {
        let now = self.clock.now();
        let session = self.store.transaction(|tx| {
            let task = store::load_task(tx, task_id)?.ok_or(Error::TaskNotFound(task_id))?;
            if let Some(active) = store::active_session_id(tx, task_id)? {
                return Err(conflict(task_id, active));
            }
            let mut session = DictationSession::create(&task);
            session.start(now)?;
            store::insert_session(tx, &mut session).map_err(|err| map_conflict(tx, task_id, err))?;
            Ok(session)
        });
        let session = session.inspect_err(|err| warn!(task_id, %err, "start rejected"))?;
        info!(session_id = session.id, task_id, learner_id = session.learner_id, "session started");
        Ok(session.id)
    }

    /// The session currently in progress for a task, if any
    pub fn active_session(&self, task_id: TaskId) -> Result<Option<DictationSession>> {
        self.store.read(|conn| match store::active_session_id(conn, task_id)? {
            Some(session_id) => store::load_session(conn, session_id),
            None => Ok(None),
        })
    }

    pub fn session(&self, session_id: SessionId) -> Result<DictationSession> {
        self.store.read(|conn| load_session(conn, session_id))
    }

    pub fn submit_answer(
        &self,
        session_id: SessionId,
        word_id: WordId,
        user_input: &str,
        time_spent_secs: u32,
    ) -> Result<DictationDetail> {
        let detail = self.store.transaction(|tx| {
            let mut session = load_session(tx, session_id)?;
            let detail = session
                .record_answer(word_id, user_input, time_spent_secs)?
                .clone();
            store::update_session(tx, &session)?;
            Ok(detail)
        });
        let detail = detail.inspect_err(|err| warn!(session_id, word_id, %err, "answer rejected"))?;
        debug!(session_id, word_id, correct = ?detail.is_correct, retries = detail.retry_count, "answer recorded");
        Ok(detail)
    }

    /// Finish a session and fold each distinct word's outcome into the
    /// learner's mastery, all in one transaction. Retrying on a finished
    /// session returns the stored summary without touching mastery.
    pub fn complete_session(&self, session_id: SessionId) -> Result<SessionSummary> {
        let now = self.clock.now();
        let summary = self.store.transaction(|tx| {
            let mut session = load_session(tx, session_id)?;
            match session.complete(now)? {
                Completion::AlreadyTerminal(summary) => {
                    debug!(session_id, status = %summary.status, "session already finished");
                    Ok(summary)
                }
                Completion::Finished { summary, outcomes } => {
                    store::update_session(tx, &session)?;
                    self.apply_outcomes(tx, session.learner_id, &outcomes, now)?;
                    Ok(summary)
                }
            }
        });
        let summary = summary.inspect_err(|err| warn!(session_id, %err, "complete rejected"))?;
        info!(
            session_id,
            correct = summary.correct_count,
            total = summary.total_words,
            accuracy = summary.accuracy,
            "session completed"
        );
        Ok(summary)
    }

    fn apply_outcomes(
        &self,
        conn: &Connection,
        learner_id: LearnerId,
        outcomes: &[(WordId, bool)],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let word_ids: Vec<WordId> = outcomes.iter().map(|(word_id, _)| *word_id).collect();
        let mut states = conn.load_mastery_states(learner_id, &word_ids)?;

        let updated: Vec<WordMasteryState> = outcomes
            .iter()
            .map(|&(word_id, is_correct)| {
                let state = states
                    .remove(&word_id)
                    .unwrap_or_else(|| WordMasteryState::new(learner_id, word_id));
                let next = apply_outcome(state, is_correct, now, &self.intervals);
                debug!(learner_id, word_id, is_correct, stage = next.stage, score = next.mastery_score, "mastery updated");
                next
            })
            .collect();

        conn.save_mastery_states(&updated)
    }

    /// Abandon a session. Mastery is left untouched.
    pub fn interrupt_session(&self, session_id: SessionId) -> Result<SessionSummary> {
        let now = self.clock.now();
        let result = self.store.transaction(|tx| {
            let mut session = load_session(tx, session_id)?;
            let was_terminal = session.status.is_terminal();
            let summary = session.interrupt(now)?;
            if !was_terminal {
                store::update_session(tx, &session)?;
            }
            Ok((summary, was_terminal))
        });
        let (summary, was_terminal) =
            result.inspect_err(|err| warn!(session_id, %err, "interrupt rejected"))?;
        if was_terminal {
            debug!(session_id, status = %summary.status, "session already finished");
        } else {
            info!(session_id, "session interrupted");
        }
        Ok(summary)
    }

    /// Record a changed verdict for an answer of a completed session. The
    /// stored detail and mastery stay as they were.
    pub fn correct_answer(
        &self,
        session_id: SessionId,
        word_id: WordId,
        corrected_input: &str,
        reason: Option<&str>,
    ) -> Result<AnswerCorrection> {
        let now = self.clock.now();
        let correction = self.store.transaction(|tx| {
            let session = load_session(tx, session_id)?;
            if session.status != SessionStatus::Completed {
                return Err(Error::InvalidTransition {
                    session_id,
                    from: session.status,
                    action: "correct an answer of",
                });
            }
            let detail = session
                .details
                .iter()
                .find(|d| d.word_id == word_id)
                .ok_or(Error::WordNotInSession {
                    session_id,
                    word_id,
                })?;

            let correction = AnswerCorrection {
                session_id,
                word_id,
                previous_input: detail.user_input.clone(),
                previous_correct: detail.is_correct,
                corrected_input: corrected_input.to_string(),
                corrected_correct: corrected_input == detail.expected_text,
                reason: reason.map(str::to_string),
                corrected_at: now,
            };
            store::insert_correction(tx, &correction)?;
            Ok(correction)
        });
        let correction = correction.inspect_err(|err| warn!(session_id, word_id, %err, "correction rejected"))?;
        info!(session_id, word_id, correct = correction.corrected_correct, "answer corrected");
        Ok(correction)
    }

    pub fn corrections(&self, session_id: SessionId) -> Result<Vec<AnswerCorrection>> {
        self.store.read(|conn| {
            load_session(conn, session_id)?;
            store::load_corrections(conn, session_id)
        })
    }

    // ---- mastery ----

    pub fn get_mastery(&self, learner_id: LearnerId, word_id: WordId) -> Result<Option<WordMasteryState>> {
        let mut states = self
            .store
            .read(|conn| conn.load_mastery_states(learner_id, &[word_id]))?;
        Ok(states.remove(&word_id))
    }

    pub fn learner_states(&self, learner_id: LearnerId) -> Result<Vec<WordMasteryState>> {
        self.store
            .read(|conn| store::load_learner_states(conn, learner_id))
    }

    // ---- statistics ----

    fn completed_in(&self, learner_id: LearnerId, range: DateRange) -> Result<Vec<DictationSession>> {
        let (from, to) = range.bounds();
        self.store
            .read(|conn| store::load_completed_sessions(conn, learner_id, from, to))
    }

    pub fn overview(&self, learner_id: LearnerId, range: DateRange) -> Result<Overview> {
        let sessions = self.completed_in(learner_id, range)?;
        Ok(stats::overview(learner_id, range, &sessions))
    }

    pub fn error_patterns(&self, learner_id: LearnerId, range: DateRange) -> Result<ErrorPatterns> {
        let sessions = self.completed_in(learner_id, range)?;
        Ok(stats::error_patterns(&sessions))
    }

    /// Words of one unit a learner got wrong, over all completed sessions
    pub fn unit_errors(
        &self,
        learner_id: LearnerId,
        scope: &CatalogScope,
        unit: u32,
        lesson: Option<u32>,
    ) -> Result<Vec<UnitErrorRow>> {
        let words = self.catalog.scope_words(scope);
        let sessions = self
            .store
            .read(|conn| store::load_all_completed_sessions(conn, learner_id))?;
        Ok(stats::unit_errors(&words, unit, lesson, &sessions))
    }

    pub fn kind_progress(&self, learner_id: LearnerId, scope: &CatalogScope) -> Result<Vec<KindProgress>> {
        let words = self.catalog.scope_words(scope);
        let word_ids: Vec<WordId> = words.iter().map(|w| w.word_id).collect();
        let states = self
            .store
            .read(|conn| conn.load_mastery_states(learner_id, &word_ids))?;
        Ok(stats::kind_progress(&words, &states))
    }

    /// Daily buckets of the overview as CSV
    pub fn export_daily_csv<W: Write>(&self, learner_id: LearnerId, range: DateRange, writer: W) -> Result<()> {
        let overview = self.overview(learner_id, range)?;
        stats::write_daily_csv(&overview.daily, writer)
    }
}

fn load_session(conn: &Connection, session_id: SessionId) -> Result<DictationSession> {
    store::load_session(conn, session_id)?.ok_or(Error::SessionNotFound(session_id))
}

fn conflict(task_id: TaskId, active_session_id: SessionId) -> Error {
    Error::SessionConflict {
        task_id,
        active_session_id,
    }
}

/// Turn a tripped one-running-session index into a conflict error
fn map_conflict(conn: &Connection, task_id: TaskId, err: Error) -> Error {
    match &err {
        Error::Storage(e) if store::is_unique_violation(e) => {
            match store::active_session_id(conn, task_id) {
                Ok(Some(active)) => conflict(task_id, active),
                _ => err,
            }
        }
        _ => err,
    }
}
