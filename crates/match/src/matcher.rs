use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use tally_core::{CategoryRef, HistoricalPattern, MatcherSettings, Transaction};

use crate::normalize::{jaccard_score, normalize_description, token_set};

/// How much more a human correction counts than an AI-only assignment.
const MANUAL_WEIGHT: f64 = 2.0;

/// Ordered best-first: when one historical transaction is found by several
/// matchers, the higher-ranked kind is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MatchKind {
    Exact,
    Fuzzy,
    AmountRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternMatch {
    pub pattern: HistoricalPattern,
    pub kind: MatchKind,
    /// Raw similarity, 0-100.
    pub score: f64,
    /// `score * 2` when the pattern's category was manually corrected.
    pub weighted_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorySuggestion {
    pub category: CategoryRef,
    /// 0-100.
    pub confidence: f64,
}

/// Finds previously categorized transactions similar to a new one and turns
/// them into a category suggestion. Three matchers (exact description, fuzzy
/// token-set, amount range) run independently over the eligible pool and
/// their outputs are unioned.
pub struct PatternMatcher {
    settings: MatcherSettings,
}

impl PatternMatcher {
    pub fn new(settings: MatcherSettings) -> Self {
        PatternMatcher { settings }
    }

    /// Ranked best-first, at most `limit` entries, one per historical
    /// transaction.
    pub fn find_similar(
        &self,
        tx: &Transaction,
        pool: &[Transaction],
        limit: usize,
    ) -> Vec<PatternMatch> {
        let eligible: Vec<HistoricalPattern> = pool
            .iter()
            .filter_map(HistoricalPattern::from_transaction)
            .filter(|p| self.within_lookback(tx, p))
            .collect();

        let mut best: HashMap<String, PatternMatch> = HashMap::new();
        for pattern in &eligible {
            for candidate in self.score_pattern(tx, pattern) {
                match best.get(&pattern.transaction_id) {
                    Some(existing) if !prefer(&candidate, existing) => {}
                    _ => {
                        best.insert(pattern.transaction_id.clone(), candidate);
                    }
                }
            }
        }

        let mut matches: Vec<PatternMatch> = best.into_values().collect();
        matches.sort_by(|a, b| {
            b.weighted_score
                .partial_cmp(&a.weighted_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.pattern.transaction_id.cmp(&b.pattern.transaction_id))
        });
        matches.truncate(limit);
        matches
    }

    /// Groups matches by category, sums weighted scores, and scores the
    /// winner's confidence from agreement ratio (50%), average raw match
    /// quality (40%), and a 10-point bonus when a manual correction backs it.
    pub fn suggest_category(&self, matches: &[PatternMatch]) -> Option<CategorySuggestion> {
        if matches.is_empty() {
            return None;
        }

        let mut by_category: HashMap<&str, Vec<&PatternMatch>> = HashMap::new();
        for m in matches {
            by_category.entry(&m.pattern.category.id).or_default().push(m);
        }

        let (_, winners) = by_category.into_iter().max_by(|(id_a, a), (id_b, b)| {
            let sum_a: f64 = a.iter().map(|m| m.weighted_score).sum();
            let sum_b: f64 = b.iter().map(|m| m.weighted_score).sum();
            sum_a
                .partial_cmp(&sum_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| id_b.cmp(id_a))
        })?;

        let agreement = winners.len() as f64 / matches.len() as f64;
        // Raw scores here, not weighted: this measures genuine similarity
        // rather than override inflation.
        let avg_quality =
            winners.iter().map(|m| m.score).sum::<f64>() / winners.len() as f64;
        let manual_bonus = if winners.iter().any(|m| m.pattern.is_manual) {
            10.0
        } else {
            0.0
        };
        let confidence = (50.0 * agreement + 0.4 * avg_quality + manual_bonus).min(100.0);

        Some(CategorySuggestion {
            category: winners[0].pattern.category.clone(),
            confidence,
        })
    }

    fn within_lookback(&self, tx: &Transaction, pattern: &HistoricalPattern) -> bool {
        let age_days = (tx.transaction_date - pattern.date).num_days();
        (0..=self.settings.lookback_days).contains(&age_days)
    }

    /// All matcher hits for one pattern; the caller unions and deduplicates.
    fn score_pattern(&self, tx: &Transaction, pattern: &HistoricalPattern) -> Vec<PatternMatch> {
        let mut hits = Vec::new();

        let norm_new = normalize_description(&tx.description);
        let norm_old = normalize_description(&pattern.description);

        if !norm_new.is_empty() && norm_new == norm_old {
            hits.push(self.to_match(pattern, MatchKind::Exact, 100.0));
        }

        let fuzzy = jaccard_score(&token_set(&tx.description), &token_set(&pattern.description));
        // 100 is already captured by the exact matcher.
        if fuzzy >= self.settings.fuzzy_threshold && fuzzy < 100.0 {
            hits.push(self.to_match(pattern, MatchKind::Fuzzy, fuzzy));
        }

        if let Some(score) = self.amount_score(tx, pattern) {
            hits.push(self.to_match(pattern, MatchKind::AmountRange, score));
        }

        hits
    }

    /// Linear decay from 100 at zero difference to 0 at the tolerance
    /// boundary; None outside the tolerance.
    fn amount_score(&self, tx: &Transaction, pattern: &HistoricalPattern) -> Option<f64> {
        let amount = tx.original_amount.abs().to_f64()?;
        let candidate = pattern.amount.abs().to_f64()?;
        let difference = (amount - candidate).abs();
        let tolerance = amount * self.settings.amount_tolerance_ratio;

        if tolerance == 0.0 {
            return (difference == 0.0).then_some(100.0);
        }
        if difference > tolerance {
            return None;
        }
        Some(100.0 * (1.0 - difference / tolerance))
    }

    fn to_match(&self, pattern: &HistoricalPattern, kind: MatchKind, score: f64) -> PatternMatch {
        let weighted_score = if pattern.is_manual {
            score * MANUAL_WEIGHT
        } else {
            score
        };
        PatternMatch {
            pattern: pattern.clone(),
            kind,
            score,
            weighted_score,
        }
    }
}

/// Exact > Fuzzy > AmountRange; within equal kind, higher weighted score.
fn prefer(candidate: &PatternMatch, existing: &PatternMatch) -> bool {
    match candidate.kind.cmp(&existing.kind) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => candidate.weighted_score > existing.weighted_score,
    }
}
