//! Grounding confidence for generated answers.
//!
//! Combines three signals over the reranked selection:
//! top score (weight 0.4), mean of the top three scores (0.2), and
//! token-level overlap between the answer and the selected context (0.3).
//! The weighted sum is rescaled by the total weight so configured
//! thresholds read on a [0,1] scale. An answer that states it lacks
//! information is `none` regardless of the other signals.

use std::collections::HashSet;

use crate::config::ConfidenceThresholds;
use crate::lexical::tokenize;
use crate::models::{Confidence, ConfidenceLevel, RetrievedChunk};

const WEIGHT_TOP: f32 = 0.4;
const WEIGHT_MEAN3: f32 = 0.2;
const WEIGHT_OVERLAP: f32 = 0.3;

/// Phrases that mark an explicitly ungrounded answer.
const INSUFFICIENT_MARKERS: &[&str] = &[
    "do not contain enough information",
    "don't contain enough information",
    "insufficient information",
    "not available in the provided documents",
    "cannot answer",
    "unable to synthesize",
];

pub fn score(
    answer: &str,
    selected: &[RetrievedChunk],
    thresholds: &ConfidenceThresholds,
) -> Confidence {
    if selected.is_empty() || is_insufficient(answer) {
        return Confidence::none();
    }

    let top = selected[0].score.clamp(0.0, 1.0);
    let mean3 = {
        let n = selected.len().min(3);
        selected[..n].iter().map(|c| c.score.clamp(0.0, 1.0)).sum::<f32>() / n as f32
    };
    let overlap = answer_overlap(answer, selected);

    let raw = WEIGHT_TOP * top + WEIGHT_MEAN3 * mean3 + WEIGHT_OVERLAP * overlap;
    let value = raw / (WEIGHT_TOP + WEIGHT_MEAN3 + WEIGHT_OVERLAP);

    let level = if value >= thresholds.high {
        ConfidenceLevel::High
    } else if value >= thresholds.medium {
        ConfidenceLevel::Medium
    } else if value >= thresholds.low {
        ConfidenceLevel::Low
    } else {
        ConfidenceLevel::None
    };

    Confidence {
        level,
        score: value,
    }
}

pub fn is_insufficient(answer: &str) -> bool {
    let lower = answer.to_lowercase();
    INSUFFICIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Fraction of the answer's terms that occur in the selected context.
fn answer_overlap(answer: &str, selected: &[RetrievedChunk]) -> f32 {
    let answer_terms = tokenize(answer);
    if answer_terms.is_empty() {
        return 0.0;
    }
    let context_terms: HashSet<String> = selected
        .iter()
        .flat_map(|c| tokenize(&c.text))
        .collect();
    let hits = answer_terms
        .iter()
        .filter(|t| context_terms.contains(*t))
        .count();
    hits as f32 / answer_terms.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: "c".to_string(),
            doc_id: "d".to_string(),
            page: 1,
            text: text.to_string(),
            score,
        }
    }

    fn thresholds() -> ConfidenceThresholds {
        ConfidenceThresholds::default()
    }

    #[test]
    fn grounded_answer_scores_high() {
        let selected = vec![
            chunk("The warranty covers manufacturing defects for two years.", 0.95),
            chunk("Warranty claims require the original receipt.", 0.9),
        ];
        let confidence = score(
            "The warranty covers manufacturing defects for two years.",
            &selected,
            &thresholds(),
        );
        assert_eq!(confidence.level, ConfidenceLevel::High);
        assert!(confidence.score >= 0.75);
    }

    #[test]
    fn fabricated_answer_scores_lower_than_grounded() {
        let selected = vec![chunk("The warranty covers defects for two years.", 0.9)];
        let grounded = score("Warranty covers defects two years.", &selected, &thresholds());
        let fabricated = score(
            "Quantum entanglement enables faster communication protocols.",
            &selected,
            &thresholds(),
        );
        assert!(grounded.score > fabricated.score);
    }

    #[test]
    fn insufficient_phrasing_forces_none() {
        let selected = vec![chunk("Some highly relevant text.", 0.99)];
        let confidence = score(
            "The documents do not contain enough information to answer that.",
            &selected,
            &thresholds(),
        );
        assert_eq!(confidence.level, ConfidenceLevel::None);
        assert_eq!(confidence.score, 0.0);
    }

    #[test]
    fn empty_selection_is_none() {
        let confidence = score("anything", &[], &thresholds());
        assert_eq!(confidence.level, ConfidenceLevel::None);
    }

    #[test]
    fn weak_retrieval_lands_low_or_none() {
        let selected = vec![chunk("barely related words", 0.1)];
        let confidence = score("completely different topic sentence", &selected, &thresholds());
        assert!(matches!(
            confidence.level,
            ConfidenceLevel::Low | ConfidenceLevel::None
        ));
    }
}
