//! Embedding-based signal relevance scoring.
//!
//! Ranks signals by cosine similarity to a context string (usually a meeting
//! title and agenda) using the local embedding model.

use crate::embeddings::{cosine_similarity, EmbeddingModel};

use super::bus::SignalEvent;

/// Prefix for query embeddings.
const QUERY_PREFIX: &str = "search_query: ";
/// Prefix for document embeddings.
const DOCUMENT_PREFIX: &str = "search_document: ";

/// Text embedded for one signal.
pub fn document_text(signal: &SignalEvent) -> String {
    let described = signal.metadata.describe();
    if described.is_empty() {
        format!("{}{}", DOCUMENT_PREFIX, signal.signal_type.display_label())
    } else {
        format!("{}{} {}", DOCUMENT_PREFIX, signal.signal_type.display_label(), described)
    }
}

/// Rank signals by embedding similarity to `context`.
///
/// Returns signals paired with their relevance score, sorted descending.
/// An empty context or an unavailable model yields zero scores in input
/// order. The sort is stable, so equal scores keep input order too.
pub fn rank(model: &EmbeddingModel, signals: &[SignalEvent], context: &str) -> Vec<(SignalEvent, f64)> {
    let unranked = || signals.iter().map(|s| (s.clone(), 0.0)).collect();
    if signals.is_empty() || context.trim().is_empty() {
        return unranked();
    }

    let query_vec = match model.embed(&format!("{}{}", QUERY_PREFIX, context)) {
        Ok(v) => v,
        Err(e) => {
            log::debug!("Relevance: model unavailable ({}), returning unranked", e);
            return unranked();
        }
    };

    let mut scored: Vec<(SignalEvent, f64)> = signals
        .iter()
        .map(|signal| {
            let score = model
                .embed(&document_text(signal))
                .map(|doc_vec| cosine_similarity(&query_vec, &doc_vec) as f64)
                .unwrap_or(0.0);
            (signal.clone(), score)
        })
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

/// The `n` most relevant signals.
pub fn top_n(model: &EmbeddingModel, signals: &[SignalEvent], context: &str, n: usize) -> Vec<(SignalEvent, f64)> {
    let mut ranked = rank(model, signals, context);
    ranked.truncate(n);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKey;
    use crate::signals::payload::{SignalPayload, SignalType};

    fn signal(id: &str, signal_type: SignalType, note: &str) -> SignalEvent {
        SignalEvent {
            seq: 0,
            id: id.to_string(),
            source: "propagation".to_string(),
            signal_type,
            target: EntityKey::account("a1"),
            confidence: 0.85,
            context_tag: None,
            created_at: "2026-01-01T00:00:00.000000Z".to_string(),
            metadata: SignalPayload::Note { text: note.to_string() },
        }
    }

    #[test]
    fn test_rank_empty_signals() {
        let model = EmbeddingModel::new();
        assert!(rank(&model, &[], "test context").is_empty());
    }

    #[test]
    fn test_rank_empty_context_keeps_order() {
        let model = EmbeddingModel::new();
        let signals = vec![
            signal("s1", SignalType::StakeholderChange, "Alice promoted to CRO"),
            signal("s2", SignalType::ChampionRisk, "Bob unhappy"),
        ];
        let result = rank(&model, &signals, "");
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].0.id, "s1");
        assert!(result.iter().all(|(_, score)| *score == 0.0));
    }

    #[test]
    fn test_rank_prefers_matching_signal() {
        let model = EmbeddingModel::new();
        let signals = vec![
            signal("offsite", SignalType::Custom("note".into()), "team offsite lunch planning"),
            signal("renewal", SignalType::RenewalAtRisk, "acme renewal contract silence"),
        ];
        let result = rank(&model, &signals, "acme renewal contract");
        assert_eq!(result[0].0.id, "renewal");
        assert!(result[0].1 > result[1].1);
    }

    #[test]
    fn test_top_n_bounds_output() {
        let model = EmbeddingModel::new();
        let signals: Vec<SignalEvent> = (0..5)
            .map(|i| signal(&format!("s{i}"), SignalType::EngagementWarning, "quiet account"))
            .collect();
        assert_eq!(top_n(&model, &signals, "quiet", 3).len(), 3);
        assert_eq!(top_n(&model, &signals, "quiet", 10).len(), 5);
    }

    #[test]
    fn test_unavailable_model_is_unranked() {
        let model = EmbeddingModel::new();
        model.set_unavailable("off".to_string());
        let signals = vec![signal("s1", SignalType::ChampionRisk, "x")];
        let result = rank(&model, &signals, "x");
        assert_eq!(result[0].1, 0.0);
    }
}
