use crate::catalog::CatalogWord;
use crate::mastery::{WordMasteryState, MASTERY_THRESHOLD};
use crate::WordId;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// How the next batch of practice words is chosen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum SelectionMode {
    /// Due, not yet mastered words, weighted toward low mastery
    Due,
    /// Uniform sample of one textbook unit, ignoring mastery
    Unit { unit: u32 },
    /// Mostly the given unit, topped up with due words from earlier units
    Blend { unit: u32 },
}

impl SelectionMode {
    pub fn selector(&self, blend_unit_share: f64) -> Box<dyn WordSelector> {
        match *self {
            SelectionMode::Due => Box::new(DueReviewSelector::default()),
            SelectionMode::Unit { unit } => Box::new(UnitSelector { unit }),
            SelectionMode::Blend { unit } => Box::new(BlendSelector {
                unit,
                unit_share: blend_unit_share,
            }),
        }
    }
}

/// Snapshot a selector works from: catalog slice plus the learner's states
#[derive(Debug, Clone, Copy)]
pub struct SelectionPool<'a> {
    /// Catalog words of the scope, in insertion order
    pub words: &'a [CatalogWord],
    /// Mastery rows keyed by word; absent means never attempted
    pub states: &'a HashMap<WordId, WordMasteryState>,
    pub now: DateTime<Utc>,
}

/// Trait for different word selection strategies
pub trait WordSelector {
    /// Pick at most `count` distinct word ids. Never fabricates entries.
    fn select_words(
        &self,
        pool: &SelectionPool<'_>,
        count: usize,
        rng: &mut dyn RngCore,
    ) -> Vec<WordId>;
}

/// Select practice words for a learner. Pure apart from the RNG.
pub fn select(
    pool: &SelectionPool<'_>,
    mode: &SelectionMode,
    count: usize,
    blend_unit_share: f64,
    rng: &mut dyn RngCore,
) -> Vec<WordId> {
    mode.selector(blend_unit_share)
        .select_words(pool, count, rng)
}

/// Narrows the catalog before a mode draws from it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionFilter {
    /// Only words of this kind (识字, 写字, 词语)
    pub kind: Option<String>,
    /// Only words the learner has answered wrong at least once
    pub wrong_only: bool,
}

impl SelectionFilter {
    pub fn is_empty(&self) -> bool {
        self.kind.is_none() && !self.wrong_only
    }

    pub fn matches(&self, word: &CatalogWord, state: Option<&WordMasteryState>) -> bool {
        if self.kind.as_ref().is_some_and(|kind| *kind != word.kind) {
            return false;
        }
        !self.wrong_only || state.is_some_and(|s| s.attempts > s.correct_attempts)
    }

    /// Catalog words that pass the filter, in catalog order
    pub fn apply(
        &self,
        words: &[CatalogWord],
        states: &HashMap<WordId, WordMasteryState>,
    ) -> Vec<CatalogWord> {
        words
            .iter()
            .filter(|word| self.matches(word, states.get(&word.word_id)))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    word_id: WordId,
    weight: f64,
    last_attempt_at: Option<DateTime<Utc>>,
    catalog_idx: usize,
}

/// Heavier first; equal weights put the oldest attempt first and
/// never-attempted words after, in catalog order
fn review_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.weight
        .partial_cmp(&a.weight)
        .unwrap_or(Ordering::Equal)
        .then_with(|| match (a.last_attempt_at, b.last_attempt_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.catalog_idx.cmp(&b.catalog_idx))
}

/// Due-review selection with weight `1 - mastery_score`
#[derive(Debug, Default, Clone)]
pub struct DueReviewSelector {
    /// Only units strictly below this one
    pub before_unit: Option<u32>,
}

impl DueReviewSelector {
    fn candidates(&self, pool: &SelectionPool<'_>) -> Vec<Candidate> {
        pool.words
            .iter()
            .enumerate()
            .filter(|(_, word)| self.before_unit.map_or(true, |unit| word.unit < unit))
            .filter_map(|(catalog_idx, word)| match pool.states.get(&word.word_id) {
                None => Some(Candidate {
                    word_id: word.word_id,
                    weight: 1.0,
                    last_attempt_at: None,
                    catalog_idx,
                }),
                Some(state)
                    if state.is_due(pool.now) && state.mastery_score < MASTERY_THRESHOLD =>
                {
                    Some(Candidate {
                        word_id: word.word_id,
                        weight: 1.0 - state.mastery_score,
                        last_attempt_at: state.last_attempt_at,
                        catalog_idx,
                    })
                }
                Some(_) => None,
            })
            .collect()
    }
}

impl WordSelector for DueReviewSelector {
    fn select_words(
        &self,
        pool: &SelectionPool<'_>,
        count: usize,
        rng: &mut dyn RngCore,
    ) -> Vec<WordId> {
        let candidates = self.candidates(pool);
        tracing::debug!(pool = candidates.len(), count, "due review candidates");

        // the draw decides which words, the review order decides how they are listed
        let mut picked = weighted_sample(candidates, count, rng);
        picked.sort_by(review_order);
        picked.into_iter().map(|c| c.word_id).collect()
    }
}

/// Weighted sampling without replacement (Efraimidis & Spirakis, A-ES).
///
/// Every candidate draws `u ~ U(0, 1)` and gets the key `ln(u) / weight`;
/// the `count` largest keys are the sample. This equals drawing one item at
/// a time with probability proportional to weight. Keys are drawn in input
/// order, so a seeded RNG gives a reproducible sample.
fn weighted_sample(
    candidates: Vec<Candidate>,
    count: usize,
    rng: &mut dyn RngCore,
) -> Vec<Candidate> {
    let mut keyed: Vec<(f64, Candidate)> = candidates
        .into_iter()
        .filter(|c| c.weight > 0.0)
        .map(|c| {
            let u: f64 = rng.gen();
            (u.ln() / c.weight, c)
        })
        .collect();

    keyed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
    keyed.into_iter().take(count).map(|(_, c)| c).collect()
}

/// Uniform sample of one unit
#[derive(Debug, Clone)]
pub struct UnitSelector {
    pub unit: u32,
}

impl WordSelector for UnitSelector {
    fn select_words(
        &self,
        pool: &SelectionPool<'_>,
        count: usize,
        rng: &mut dyn RngCore,
    ) -> Vec<WordId> {
        let unit_words: Vec<WordId> = pool
            .words
            .iter()
            .filter(|word| word.unit == self.unit)
            .map(|word| word.word_id)
            .collect();

        if unit_words.len() <= count {
            return unit_words;
        }
        unit_words.choose_multiple(rng, count).copied().collect()
    }
}

/// Current-unit practice mixed with review of earlier material
#[derive(Debug, Clone)]
pub struct BlendSelector {
    pub unit: u32,
    /// Share of `count` taken from the current unit
    pub unit_share: f64,
}

impl WordSelector for BlendSelector {
    fn select_words(
        &self,
        pool: &SelectionPool<'_>,
        count: usize,
        rng: &mut dyn RngCore,
    ) -> Vec<WordId> {
        let unit_quota = (count as f64 * self.unit_share.clamp(0.0, 1.0)).floor() as usize;
        let mut words = UnitSelector { unit: self.unit }.select_words(pool, unit_quota, rng);

        // review only covers earlier units, so the two parts never overlap
        let review = DueReviewSelector {
            before_unit: Some(self.unit),
        };
        words.extend(review.select_words(pool, count - words.len(), rng));
        words.shuffle(rng);
        words
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mastery::{apply_outcome, IntervalTable};
    use chrono::{Duration, TimeZone};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 20, 18, 0, 0).unwrap()
    }

    fn catalog_word(word_id: WordId, unit: u32) -> CatalogWord {
        CatalogWord {
            word_id,
            text: format!("w{word_id}"),
            pinyin: String::new(),
            hint: None,
            kind: "词语".to_string(),
            unit,
            lesson: None,
        }
    }

    fn state(word_id: WordId, score: f64, last: Option<DateTime<Utc>>, due: Option<DateTime<Utc>>) -> WordMasteryState {
        WordMasteryState {
            learner_id: 1,
            word_id,
            stage: 1,
            attempts: 10,
            correct_attempts: (score * 10.0).round() as u32,
            mastery_score: score,
            last_attempt_at: last,
            next_due_at: due,
            is_mastered: score >= MASTERY_THRESHOLD,
        }
    }

    fn states_of(list: Vec<WordMasteryState>) -> HashMap<WordId, WordMasteryState> {
        list.into_iter().map(|s| (s.word_id, s)).collect()
    }

    #[test]
    fn test_due_pool_excludes_future_and_mastered() {
        let words: Vec<CatalogWord> = (1..=4).map(|id| catalog_word(id, 1)).collect();
        let past = Some(now() - Duration::hours(1));
        let future = Some(now() + Duration::hours(1));
        let states = states_of(vec![
            state(1, 0.5, past, past),
            state(2, 0.5, past, future),
            state(3, 0.9, past, past),
        ]);
        let pool = SelectionPool { words: &words, states: &states, now: now() };

        let mut rng = StdRng::seed_from_u64(7);
        let picked = DueReviewSelector::default().select_words(&pool, 10, &mut rng);
        let picked: HashSet<WordId> = picked.into_iter().collect();
        assert_eq!(picked, HashSet::from([1, 4]));
    }

    #[test]
    fn test_due_pool_smaller_than_count_returns_all() {
        let words: Vec<CatalogWord> = (1..=3).map(|id| catalog_word(id, 1)).collect();
        let states = HashMap::new();
        let pool = SelectionPool { words: &words, states: &states, now: now() };

        let mut rng = StdRng::seed_from_u64(1);
        let picked = select(&pool, &SelectionMode::Due, 10, 0.7, &mut rng);
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn test_empty_pool_yields_empty_list() {
        let words: Vec<CatalogWord> = Vec::new();
        let states = HashMap::new();
        let pool = SelectionPool { words: &words, states: &states, now: now() };

        let mut rng = StdRng::seed_from_u64(1);
        for mode in [
            SelectionMode::Due,
            SelectionMode::Unit { unit: 1 },
            SelectionMode::Blend { unit: 1 },
        ] {
            assert!(select(&pool, &mode, 5, 0.7, &mut rng).is_empty());
        }
    }

    #[test]
    fn test_same_seed_same_selection() {
        let words: Vec<CatalogWord> = (1..=20).map(|id| catalog_word(id, 1)).collect();
        let states = HashMap::new();
        let pool = SelectionPool { words: &words, states: &states, now: now() };

        let first = select(&pool, &SelectionMode::Due, 5, 0.7, &mut StdRng::seed_from_u64(99));
        let second = select(&pool, &SelectionMode::Due, 5, 0.7, &mut StdRng::seed_from_u64(99));
        assert_eq!(first, second);
    }

    #[test]
    fn test_low_mastery_drawn_more_often() {
        let words: Vec<CatalogWord> = (1..=3).map(|id| catalog_word(id, 1)).collect();
        let past = Some(now() - Duration::days(1));
        let states = states_of(vec![
            state(1, 0.0, past, past),
            state(2, 0.5, past, past),
            state(3, 0.7, past, past),
        ]);
        let pool = SelectionPool { words: &words, states: &states, now: now() };

        let mut counts: HashMap<WordId, usize> = HashMap::new();
        let mut rng = StdRng::seed_from_u64(2024);
        for _ in 0..3000 {
            let picked = DueReviewSelector::default().select_words(&pool, 1, &mut rng);
            assert_eq!(picked.len(), 1);
            *counts.entry(picked[0]).or_default() += 1;
        }

        // expected shares are 1.0 : 0.5 : 0.3
        assert!(counts[&1] > counts[&2]);
        assert!(counts[&2] > counts[&3]);
    }

    #[test]
    fn test_unattempted_words_come_back_in_catalog_order() {
        let words: Vec<CatalogWord> = (1..=5).map(|id| catalog_word(id, 1)).collect();
        let states = HashMap::new();
        let pool = SelectionPool { words: &words, states: &states, now: now() };

        for seed in 0..5 {
            let mut rng = StdRng::seed_from_u64(seed);
            let picked = select(&pool, &SelectionMode::Due, 10, 0.7, &mut rng);
            assert_eq!(picked, vec![1, 2, 3, 4, 5]);
        }
    }

    #[test]
    fn test_equal_weights_list_oldest_attempt_first() {
        let words: Vec<CatalogWord> = (1..=4).map(|id| catalog_word(id, 1)).collect();
        let older = Some(now() - Duration::days(3));
        let newer = Some(now() - Duration::days(1));
        let states = states_of(vec![
            state(3, 0.0, older, older),
            state(2, 0.0, newer, newer),
            state(4, 0.5, older, older),
        ]);
        let pool = SelectionPool { words: &words, states: &states, now: now() };

        let mut rng = StdRng::seed_from_u64(8);
        let picked = select(&pool, &SelectionMode::Due, 4, 0.7, &mut rng);
        assert_eq!(picked, vec![3, 2, 1, 4]);
    }

    #[test]
    fn test_unit_selector_ignores_mastery() {
        let mut words: Vec<CatalogWord> = (1..=4).map(|id| catalog_word(id, 1)).collect();
        words.push(catalog_word(5, 2));
        let table = IntervalTable::default();
        let mastered = apply_outcome(WordMasteryState::new(1, 1), true, now(), &table);
        let states = states_of(vec![mastered]);
        let pool = SelectionPool { words: &words, states: &states, now: now() };

        let mut rng = StdRng::seed_from_u64(3);
        let all = UnitSelector { unit: 1 }.select_words(&pool, 10, &mut rng);
        assert_eq!(all, vec![1, 2, 3, 4]);

        let some = UnitSelector { unit: 1 }.select_words(&pool, 2, &mut rng);
        assert_eq!(some.len(), 2);
        assert!(some.iter().all(|id| (1..=4).contains(id)));
        assert_ne!(some[0], some[1]);
    }

    #[test]
    fn test_blend_mixes_unit_and_review() {
        let mut words: Vec<CatalogWord> = (1..=10).map(|id| catalog_word(id, 2)).collect();
        words.extend((11..=20).map(|id| catalog_word(id, 1)));
        let states = HashMap::new();
        let pool = SelectionPool { words: &words, states: &states, now: now() };

        let mut rng = StdRng::seed_from_u64(11);
        let picked = BlendSelector { unit: 2, unit_share: 0.7 }.select_words(&pool, 10, &mut rng);

        assert_eq!(picked.len(), 10);
        let unique: HashSet<WordId> = picked.iter().copied().collect();
        assert_eq!(unique.len(), 10);
        assert_eq!(picked.iter().filter(|id| **id <= 10).count(), 7);
    }

    #[test]
    fn test_blend_fills_remainder_from_review_when_unit_is_short() {
        let mut words: Vec<CatalogWord> = (1..=2).map(|id| catalog_word(id, 3)).collect();
        words.extend((3..=10).map(|id| catalog_word(id, 1)));
        let states = HashMap::new();
        let pool = SelectionPool { words: &words, states: &states, now: now() };

        let mut rng = StdRng::seed_from_u64(5);
        let picked = BlendSelector { unit: 3, unit_share: 0.7 }.select_words(&pool, 6, &mut rng);
        assert_eq!(picked.len(), 6);
        assert_eq!(picked.iter().filter(|id| **id <= 2).count(), 2);
    }

    #[test]
    fn test_blend_never_reviews_later_units() {
        let words = vec![
            catalog_word(1, 1),
            catalog_word(2, 1),
            catalog_word(3, 2),
            catalog_word(4, 3),
        ];
        let states = HashMap::new();
        let pool = SelectionPool { words: &words, states: &states, now: now() };

        for seed in 0..10 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut picked = select(&pool, &SelectionMode::Blend { unit: 1 }, 4, 0.7, &mut rng);
            picked.sort();
            assert_eq!(picked, vec![1, 2]);

            let mut picked = select(&pool, &SelectionMode::Blend { unit: 2 }, 4, 0.7, &mut rng);
            picked.sort();
            assert_eq!(picked, vec![1, 2, 3]);
        }
    }

    #[test]
    fn test_filter_by_kind_and_wrong_answers() {
        let mut words: Vec<CatalogWord> = (1..=4).map(|id| catalog_word(id, 1)).collect();
        words[0].kind = "识字".to_string();
        words[1].kind = "识字".to_string();
        let past = Some(now() - Duration::days(1));
        let states = states_of(vec![
            state(1, 1.0, past, past),
            state(2, 0.5, past, past),
            state(3, 0.3, past, past),
        ]);
        let ids = |filter: &SelectionFilter| -> Vec<WordId> {
            filter.apply(&words, &states).iter().map(|w| w.word_id).collect()
        };

        let literacy = SelectionFilter {
            kind: Some("识字".to_string()),
            wrong_only: false,
        };
        assert_eq!(ids(&literacy), vec![1, 2]);

        let wrong = SelectionFilter {
            kind: None,
            wrong_only: true,
        };
        assert_eq!(ids(&wrong), vec![2, 3]);

        let both = SelectionFilter {
            kind: Some("识字".to_string()),
            wrong_only: true,
        };
        assert_eq!(ids(&both), vec![2]);

        assert!(SelectionFilter::default().is_empty());
        assert_eq!(ids(&SelectionFilter::default()), vec![1, 2, 3, 4]);
    }
}
