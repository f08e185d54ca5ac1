//! Follow-up query suggestions.
//!
//! Deterministic: capitalized phrases are harvested from the answer and
//! selected context, frequency-ranked, filtered against the question, and
//! templated. Used directly in degraded mode and as the default path (no
//! extra model call per query).

use std::collections::HashMap;

use crate::models::RetrievedChunk;

pub const SUGGESTION_COUNT: usize = 3;

/// Words that start sentences without naming a topic.
const NON_TOPICS: &[&str] = &[
    "The", "This", "That", "These", "Those", "What", "When", "Where", "How", "Why", "Who",
    "There", "Here", "Our", "Your", "Their", "First", "Second", "Third",
];

const FALLBACKS: &[&str] = &[
    "What are the main topics covered in these documents?",
    "Can you summarize the key points?",
    "What conclusions or recommendations are made?",
];

pub fn generate(question: &str, answer: &str, selected: &[RetrievedChunk]) -> Vec<String> {
    let mut corpus = String::from(answer);
    for chunk in selected {
        corpus.push(' ');
        corpus.push_str(&chunk.text);
    }

    let question_lower = question.to_lowercase();
    let topics: Vec<String> = extract_topics(&corpus)
        .into_iter()
        .filter(|t| !question_lower.contains(&t.to_lowercase()))
        .collect();

    let mut suggestions = Vec::with_capacity(SUGGESTION_COUNT);
    let mut iter = topics.iter();
    if let Some(first) = iter.next() {
        suggestions.push(format!("Can you explain more about {}?", first));
    }
    if let Some(second) = iter.next() {
        if let Some(first) = topics.first() {
            suggestions.push(format!("How does {} relate to {}?", second, first));
        }
    }
    if let Some(third) = iter.next() {
        suggestions.push(format!("What about {}?", third));
    }

    for fallback in FALLBACKS {
        if suggestions.len() >= SUGGESTION_COUNT {
            break;
        }
        suggestions.push(fallback.to_string());
    }

    suggestions.truncate(SUGGESTION_COUNT);
    suggestions
}

/// Capitalized runs of up to three words, frequency-ranked with longer
/// phrases preferred on ties. Ranking is stable for identical input.
fn extract_topics(text: &str) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let mut counts: HashMap<String, usize> = HashMap::new();

    let is_cap = |w: &str| {
        w.chars().next().is_some_and(|c| c.is_uppercase())
            && w.chars().any(|c| c.is_lowercase())
    };

    let mut i = 0;
    while i < words.len() {
        let word = words[i].trim_matches(|c: char| !c.is_alphanumeric());
        if word.len() > 3 && is_cap(word) && !NON_TOPICS.contains(&word) {
            let mut phrase = vec![word];
            let mut j = i + 1;
            while j < words.len() && phrase.len() < 3 {
                let next = words[j].trim_matches(|c: char| !c.is_alphanumeric());
                if next.len() > 1 && is_cap(next) && !NON_TOPICS.contains(&next) {
                    phrase.push(next);
                    j += 1;
                } else {
                    break;
                }
            }
            *counts.entry(phrase.join(" ")).or_insert(0) += 1;
            i = j;
        } else {
            i += 1;
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| {
        b.1.cmp(&a.1)
            .then(b.0.split_whitespace().count().cmp(&a.0.split_whitespace().count()))
            .then(a.0.cmp(&b.0))
    });
    ranked.into_iter().map(|(topic, _)| topic).collect()
}
