use crate::error::{Error, Result};
use crate::{LearnerId, WordId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Accuracy at or above which a word counts as mastered
pub const MASTERY_THRESHOLD: f64 = 0.8;

/// Default review intervals in minutes: 5m, 30m, 12h, 1d, 2d, 4d, 7d, 15d
pub const DEFAULT_INTERVALS_MINUTES: [u64; 8] = [5, 30, 720, 1440, 2880, 5760, 10080, 21600];

/// Longest accepted review interval: ten years
pub const MAX_INTERVAL_MINUTES: u64 = 10 * 366 * 24 * 60;

/// Learning state of one word for one learner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordMasteryState {
    pub learner_id: LearnerId,
    pub word_id: WordId,
    pub stage: u32,
    pub attempts: u32,
    pub correct_attempts: u32,
    pub mastery_score: f64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_due_at: Option<DateTime<Utc>>,
    pub is_mastered: bool,
}

impl WordMasteryState {
    /// State for a word the learner has never been scored on
    pub fn new(learner_id: LearnerId, word_id: WordId) -> Self {
        Self {
            learner_id,
            word_id,
            stage: 0,
            attempts: 0,
            correct_attempts: 0,
            mastery_score: 0.0,
            last_attempt_at: None,
            next_due_at: None,
            is_mastered: false,
        }
    }

    /// Unscheduled words are always due
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_due_at.map_or(true, |due| due <= now)
    }
}

/// Spaced repetition intervals indexed by stage
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalTable {
    intervals: Vec<Duration>,
}

impl Default for IntervalTable {
    fn default() -> Self {
        Self {
            intervals: DEFAULT_INTERVALS_MINUTES
                .iter()
                .map(|&m| Duration::minutes(m as i64))
                .collect(),
        }
    }
}

impl IntervalTable {
    /// Build a table from widening intervals given in minutes
    pub fn from_minutes(minutes: &[u64]) -> Result<Self> {
        if minutes.is_empty() {
            return Err(Error::InvalidConfig(
                "review interval table must not be empty".to_string(),
            ));
        }
        if minutes.contains(&0) {
            return Err(Error::InvalidConfig(
                "review intervals must be positive".to_string(),
            ));
        }
        if minutes.windows(2).any(|pair| pair[1] < pair[0]) {
            return Err(Error::InvalidConfig(
                "review intervals must not shrink".to_string(),
            ));
        }
        if let Some(&m) = minutes.iter().find(|&&m| m > MAX_INTERVAL_MINUTES) {
            return Err(Error::InvalidConfig(format!(
                "review interval of {m} minutes exceeds the maximum of {MAX_INTERVAL_MINUTES}"
            )));
        }

        let intervals = minutes
            .iter()
            .map(|&m| Duration::minutes(m as i64))
            .collect();
        Ok(Self { intervals })
    }

    /// Highest reachable stage
    pub fn max_stage(&self) -> u32 {
        self.intervals.len() as u32
    }

    /// Interval for a stage. Stage `s >= 1` uses entry `s - 1`, stage 0
    /// shares the first entry and stages past the end keep the last one.
    pub fn interval(&self, stage: u32) -> Duration {
        let idx = (stage.max(1) as usize - 1).min(self.intervals.len() - 1);
        self.intervals[idx]
    }
}

/// Fold one scored observation into a learner's word state.
///
/// Correct answers promote one stage (capped at the table length), incorrect
/// answers demote one stage without going below zero.
pub fn apply_outcome(
    state: WordMasteryState,
    is_correct: bool,
    now: DateTime<Utc>,
    table: &IntervalTable,
) -> WordMasteryState {
    let mut next = state;

    next.attempts += 1;
    if is_correct {
        next.correct_attempts += 1;
    }
    next.mastery_score = next.correct_attempts as f64 / next.attempts as f64;

    next.stage = if is_correct {
        (next.stage + 1).min(table.max_stage())
    } else {
        next.stage.saturating_sub(1)
    };

    next.last_attempt_at = Some(now);
    next.next_due_at = Some(now + table.interval(next.stage));
    next.is_mastered = next.attempts >= 1 && next.mastery_score >= MASTERY_THRESHOLD;
    next
}

/// Repository seam for mastery rows.
///
/// The scheduling code only sees plain [`WordMasteryState`] values; SQLite
/// and in-memory stores both implement this.
pub trait MasteryRepository {
    /// States for the given words; words never attempted are absent
    fn load_mastery_states(
        &self,
        learner_id: LearnerId,
        word_ids: &[WordId],
    ) -> Result<HashMap<WordId, WordMasteryState>>;

    fn save_mastery_states(&self, states: &[WordMasteryState]) -> Result<()>;
}

/// Mastery rows kept in memory, for tests and offline tooling
#[derive(Debug, Default)]
pub struct InMemoryMasteryStore {
    rows: parking_lot::RwLock<HashMap<(LearnerId, WordId), WordMasteryState>>,
}

impl InMemoryMasteryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, state: WordMasteryState) {
        self.rows
            .write()
            .insert((state.learner_id, state.word_id), state);
    }
}

impl MasteryRepository for InMemoryMasteryStore {
    fn load_mastery_states(
        &self,
        learner_id: LearnerId,
        word_ids: &[WordId],
    ) -> Result<HashMap<WordId, WordMasteryState>> {
        let rows = self.rows.read();
        Ok(word_ids
            .iter()
            .filter_map(|word_id| {
                rows.get(&(learner_id, *word_id))
                    .map(|state| (*word_id, state.clone()))
            })
            .collect())
    }

    fn save_mastery_states(&self, states: &[WordMasteryState]) -> Result<()> {
        let mut rows = self.rows.write();
        for state in states {
            rows.insert((state.learner_id, state.word_id), state.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_first_correct_attempt() {
        let table = IntervalTable::default();
        let state = apply_outcome(WordMasteryState::new(1, 10), true, t0(), &table);

        assert_eq!(state.attempts, 1);
        assert_eq!(state.correct_attempts, 1);
        assert_eq!(state.stage, 1);
        assert_eq!(state.mastery_score, 1.0);
        assert!(state.is_mastered);
        assert_eq!(state.last_attempt_at, Some(t0()));
        assert_eq!(state.next_due_at, Some(t0() + Duration::minutes(5)));
    }

    #[test]
    fn test_incorrect_after_correct_demotes() {
        let table = IntervalTable::default();
        let first = apply_outcome(WordMasteryState::new(1, 10), true, t0(), &table);
        let later = t0() + Duration::minutes(6);
        let second = apply_outcome(first, false, later, &table);

        assert_eq!(second.attempts, 2);
        assert_eq!(second.correct_attempts, 1);
        assert_eq!(second.stage, 0);
        assert_eq!(second.mastery_score, 0.5);
        assert!(!second.is_mastered);
        assert_eq!(second.next_due_at, Some(later + Duration::minutes(5)));
    }

    #[test]
    fn test_incorrect_at_stage_zero_stays_zero() {
        let table = IntervalTable::default();
        let state = apply_outcome(WordMasteryState::new(1, 10), false, t0(), &table);

        assert_eq!(state.stage, 0);
        assert_eq!(state.attempts, 1);
        assert_eq!(state.correct_attempts, 0);
        assert_eq!(state.mastery_score, 0.0);
        assert!(!state.is_mastered);
    }

    #[test]
    fn test_stage_caps_at_table_length() {
        let table = IntervalTable::default();
        let mut state = WordMasteryState::new(1, 10);
        let mut now = t0();
        for _ in 0..20 {
            state = apply_outcome(state, true, now, &table);
            now += Duration::days(1);
        }

        assert_eq!(state.stage, table.max_stage());
        let last = state.last_attempt_at.unwrap();
        assert_eq!(state.next_due_at, Some(last + Duration::days(15)));
    }

    #[test]
    fn test_due_invariant_holds() {
        let table = IntervalTable::default();
        let mut state = WordMasteryState::new(1, 10);
        let outcomes = [true, true, false, true, true, true, false, false, true];
        let mut now = t0();
        for correct in outcomes {
            state = apply_outcome(state, correct, now, &table);
            assert_eq!(
                state.next_due_at,
                Some(state.last_attempt_at.unwrap() + table.interval(state.stage))
            );
            now += Duration::hours(13);
        }
    }

    #[test]
    fn test_interval_lookup() {
        let table = IntervalTable::default();
        assert_eq!(table.interval(0), Duration::minutes(5));
        assert_eq!(table.interval(1), Duration::minutes(5));
        assert_eq!(table.interval(2), Duration::minutes(30));
        assert_eq!(table.interval(3), Duration::hours(12));
        assert_eq!(table.interval(8), Duration::days(15));
        assert_eq!(table.interval(42), Duration::days(15));
    }

    #[test]
    fn test_interval_table_validation() {
        assert!(IntervalTable::from_minutes(&[]).is_err());
        assert!(IntervalTable::from_minutes(&[5, 0]).is_err());
        assert!(IntervalTable::from_minutes(&[30, 5]).is_err());
        assert_eq!(IntervalTable::from_minutes(&[10, 60]).unwrap().max_stage(), 2);
    }

    #[test]
    fn test_oversized_intervals_rejected() {
        assert_matches!(
            IntervalTable::from_minutes(&[5, 10_000_000_000_000]),
            Err(Error::InvalidConfig(_))
        );
        assert!(IntervalTable::from_minutes(&[5, u64::MAX]).is_err());
        assert!(IntervalTable::from_minutes(&[5, MAX_INTERVAL_MINUTES + 1]).is_err());

        // the longest accepted table still schedules without overflow
        let table = IntervalTable::from_minutes(&[5, MAX_INTERVAL_MINUTES]).unwrap();
        let mut state = WordMasteryState::new(1, 10);
        for _ in 0..3 {
            state = apply_outcome(state, true, t0(), &table);
        }
        assert_eq!(state.stage, 2);
        assert_eq!(
            state.next_due_at,
            Some(t0() + Duration::minutes(MAX_INTERVAL_MINUTES as i64))
        );
    }

    #[test]
    fn test_is_due() {
        let mut state = WordMasteryState::new(1, 10);
        assert!(state.is_due(t0()));

        state.next_due_at = Some(t0() + Duration::minutes(1));
        assert!(!state.is_due(t0()));
        assert!(state.is_due(t0() + Duration::minutes(1)));
    }

    #[test]
    fn test_in_memory_store_roundtrip() {
        let store = InMemoryMasteryStore::new();
        let state = apply_outcome(WordMasteryState::new(7, 3), true, t0(), &IntervalTable::default());
        store.save_mastery_states(&[state.clone()]).unwrap();

        let loaded = store.load_mastery_states(7, &[3, 4]).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[&3], state);
        assert!(store.load_mastery_states(8, &[3]).unwrap().is_empty());
    }
}
