//! Read-only rollups over completed dictation sessions.
//!
//! Nothing here touches storage: the engine loads sessions, catalog words and
//! mastery rows, then hands them to these functions.

use crate::catalog::CatalogWord;
use crate::error::{Error, Result};
use crate::mastery::WordMasteryState;
use crate::session::{DictationDetail, DictationSession};
use crate::util::{mean, ratio};
use crate::{LearnerId, WordId};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;

pub const ERROR_EXAMPLES_PER_TYPE: usize = 5;
pub const DIFFICULT_MIN_ATTEMPTS: u32 = 3;
pub const DIFFICULT_MIN_ERROR_RATE: f64 = 0.4;
pub const DIFFICULT_WORDS_LIMIT: usize = 10;

/// Inclusive range of calendar days (UTC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self> {
        if to < from {
            return Err(Error::InvalidConfig(format!(
                "date range ends ({to}) before it starts ({from})"
            )));
        }
        Ok(Self { from, to })
    }

    /// The `days` calendar days ending with the day of `now`
    pub fn last_days(now: DateTime<Utc>, days: u32) -> Self {
        let to = now.date_naive();
        let from = to - Duration::days(i64::from(days.max(1)) - 1);
        Self { from, to }
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let to = self.to;
        self.from.iter_days().take_while(move |day| *day <= to)
    }

    /// Half-open instant bounds `[from 00:00, to + 1 day 00:00)`
    pub fn bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.from.and_time(NaiveTime::MIN).and_utc();
        let end = (self.to + Duration::days(1)).and_time(NaiveTime::MIN).and_utc();
        (start, end)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBucket {
    pub date: NaiveDate,
    pub sessions: u32,
    pub words: u32,
    pub correct: u32,
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub learner_id: LearnerId,
    pub range: DateRange,
    pub sessions: u32,
    pub total_words: u32,
    pub correct_words: u32,
    pub accuracy: f64,
    pub avg_secs_per_word: f64,
    pub daily: Vec<DailyBucket>,
}

/// Totals and zero-filled daily buckets for sessions in `range`.
///
/// Sessions are bucketed by the UTC day they started on; sessions outside
/// the range or not completed are ignored.
pub fn overview(learner_id: LearnerId, range: DateRange, sessions: &[DictationSession]) -> Overview {
    let mut daily: BTreeMap<NaiveDate, DailyBucket> = range
        .days()
        .map(|date| {
            (
                date,
                DailyBucket {
                    date,
                    sessions: 0,
                    words: 0,
                    correct: 0,
                    accuracy: 0.0,
                },
            )
        })
        .collect();

    let mut times = Vec::new();
    for session in completed(sessions) {
        let Some(start) = session.start_time else {
            continue;
        };
        let Some(bucket) = daily.get_mut(&start.date_naive()) else {
            continue;
        };
        bucket.sessions += 1;
        bucket.words += session.details.len() as u32;
        bucket.correct += correct_in(&session.details);
        times.extend(session.details.iter().map(|d| f64::from(d.time_spent_secs)));
    }

    let mut daily: Vec<DailyBucket> = daily.into_values().collect();
    for bucket in daily.iter_mut() {
        bucket.accuracy = ratio(bucket.correct, bucket.words);
    }

    let sessions = daily.iter().map(|b| b.sessions).sum();
    let total_words = daily.iter().map(|b| b.words).sum();
    let correct_words = daily.iter().map(|b| b.correct).sum();

    Overview {
        learner_id,
        range,
        sessions,
        total_words,
        correct_words,
        accuracy: ratio(correct_words, total_words),
        avg_secs_per_word: mean(&times).unwrap_or(0.0),
        daily,
    }
}

/// Write daily buckets as CSV with a header row
pub fn write_daily_csv<W: Write>(daily: &[DailyBucket], writer: W) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    for bucket in daily {
        csv.serialize(bucket)?;
    }
    csv.flush()?;
    Ok(())
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorType {
    MissingChar,
    ExtraChar,
    SimilarChar,
}

impl ErrorType {
    pub const ALL: [ErrorType; 3] = [
        ErrorType::MissingChar,
        ErrorType::ExtraChar,
        ErrorType::SimilarChar,
    ];
}

/// Coarse classification of a wrong answer, compared in characters.
/// Unanswered items count as empty input.
pub fn classify_error(expected: &str, input: &str) -> ErrorType {
    if input.is_empty() {
        ErrorType::MissingChar
    } else if input.chars().count() > expected.chars().count() {
        ErrorType::ExtraChar
    } else {
        ErrorType::SimilarChar
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorExample {
    pub word_id: WordId,
    pub expected: String,
    pub input: String,
    pub frequency: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorTypeStat {
    pub error_type: ErrorType,
    pub count: u32,
    pub share: f64,
    pub examples: Vec<ErrorExample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifficultWord {
    pub word_id: WordId,
    pub text: String,
    pub attempts: u32,
    pub errors: u32,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPatterns {
    pub total_errors: u32,
    pub by_type: Vec<ErrorTypeStat>,
    pub difficult_words: Vec<DifficultWord>,
}

/// Error breakdown by type plus the words a learner keeps getting wrong
pub fn error_patterns(sessions: &[DictationSession]) -> ErrorPatterns {
    let details: Vec<&DictationDetail> = completed(sessions)
        .flat_map(|s| s.details.iter())
        .collect();

    let wrong: Vec<(ErrorType, &DictationDetail)> = details
        .iter()
        .filter(|d| d.is_correct != Some(true))
        .map(|d| (classify_error(&d.expected_text, input_of(d)), *d))
        .collect();
    let total_errors = wrong.len() as u32;

    let by_type = ErrorType::ALL
        .iter()
        .map(|&error_type| {
            let of_type = wrong.iter().filter(|(t, _)| *t == error_type);
            let counts = of_type
                .clone()
                .map(|(_, d)| (d.word_id, d.expected_text.as_str(), input_of(d)))
                .counts();
            let examples = counts
                .into_iter()
                .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
                .take(ERROR_EXAMPLES_PER_TYPE)
                .map(|((word_id, expected, input), frequency)| ErrorExample {
                    word_id,
                    expected: expected.to_string(),
                    input: input.to_string(),
                    frequency: frequency as u32,
                })
                .collect();
            let count = of_type.count() as u32;
            ErrorTypeStat {
                error_type,
                count,
                share: ratio(count, total_errors),
                examples,
            }
        })
        .collect();

    let mut per_word: HashMap<WordId, (String, u32, u32)> = HashMap::new();
    for detail in &details {
        let entry = per_word
            .entry(detail.word_id)
            .or_insert_with(|| (detail.expected_text.clone(), 0, 0));
        entry.1 += 1;
        if detail.is_correct != Some(true) {
            entry.2 += 1;
        }
    }
    let difficult_words = per_word
        .into_iter()
        .map(|(word_id, (text, attempts, errors))| DifficultWord {
            word_id,
            text,
            attempts,
            errors,
            error_rate: ratio(errors, attempts),
        })
        .filter(|w| w.attempts >= DIFFICULT_MIN_ATTEMPTS && w.error_rate >= DIFFICULT_MIN_ERROR_RATE)
        .sorted_by(|a, b| b.errors.cmp(&a.errors).then_with(|| a.word_id.cmp(&b.word_id)))
        .take(DIFFICULT_WORDS_LIMIT)
        .collect();

    ErrorPatterns {
        total_errors,
        by_type,
        difficult_words,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitErrorRow {
    pub word_id: WordId,
    pub text: String,
    pub pinyin: String,
    pub lesson: Option<u32>,
    pub error_count: u32,
    pub total_count: u32,
    pub last_wrong_at: Option<DateTime<Utc>>,
}

/// Words of one unit (optionally one lesson) that were written wrong at
/// least once, most errors first
pub fn unit_errors(
    words: &[CatalogWord],
    unit: u32,
    lesson: Option<u32>,
    sessions: &[DictationSession],
) -> Vec<UnitErrorRow> {
    let mut rows: HashMap<WordId, UnitErrorRow> = words
        .iter()
        .filter(|w| w.unit == unit && lesson.map_or(true, |l| w.lesson == Some(l)))
        .map(|w| {
            (
                w.word_id,
                UnitErrorRow {
                    word_id: w.word_id,
                    text: w.text.clone(),
                    pinyin: w.pinyin.clone(),
                    lesson: w.lesson,
                    error_count: 0,
                    total_count: 0,
                    last_wrong_at: None,
                },
            )
        })
        .collect();

    for session in completed(sessions) {
        let at = session.end_time.or(session.start_time);
        for detail in &session.details {
            let Some(row) = rows.get_mut(&detail.word_id) else {
                continue;
            };
            row.total_count += 1;
            if detail.is_correct != Some(true) {
                row.error_count += 1;
                row.last_wrong_at = row.last_wrong_at.max(at);
            }
        }
    }

    rows.into_values()
        .filter(|r| r.error_count > 0)
        .sorted_by(|a, b| {
            b.error_count
                .cmp(&a.error_count)
                .then_with(|| a.word_id.cmp(&b.word_id))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindProgress {
    pub kind: String,
    pub total: u32,
    pub learned: u32,
    pub mastered: u32,
}

/// Per catalog kind: how many words exist, have been attempted, are mastered
pub fn kind_progress(
    words: &[CatalogWord],
    states: &HashMap<WordId, WordMasteryState>,
) -> Vec<KindProgress> {
    let mut kinds: BTreeMap<&str, KindProgress> = BTreeMap::new();
    for word in words {
        let progress = kinds.entry(word.kind.as_str()).or_insert_with(|| KindProgress {
            kind: word.kind.clone(),
            total: 0,
            learned: 0,
            mastered: 0,
        });
        progress.total += 1;
        if let Some(state) = states.get(&word.word_id) {
            if state.attempts > 0 {
                progress.learned += 1;
            }
            if state.is_mastered {
                progress.mastered += 1;
            }
        }
    }
    kinds.into_values().collect()
}

fn completed(sessions: &[DictationSession]) -> impl Iterator<Item = &DictationSession> {
    sessions
        .iter()
        .filter(|s| s.status == crate::session::SessionStatus::Completed)
}

fn correct_in(details: &[DictationDetail]) -> u32 {
    details.iter().filter(|d| d.is_correct == Some(true)).count() as u32
}

fn input_of(detail: &DictationDetail) -> &str {
    detail.user_input.as_deref().unwrap_or("")
}
