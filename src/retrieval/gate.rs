/// Confidence gate over a ranked hit list
use super::SearchHit;
use serde::Serialize;

/// Outcome of gating; only `Accepted` hits are handed to generation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Accepted,
    /// Nothing was retrieved at all
    NoHits,
    /// Hits exist but the best one is not confident enough
    BelowThreshold { top_score: f32 },
}

impl GateDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, GateDecision::Accepted)
    }

    pub fn reason(&self) -> &'static str {
        match self {
            GateDecision::Accepted => "accepted",
            GateDecision::NoHits => "no_hits",
            GateDecision::BelowThreshold { .. } => "below_threshold",
        }
    }
}

pub fn accept(top_score: f32, threshold: f32) -> bool {
    top_score >= threshold
}

/// Gate a list already sorted best-first
pub fn evaluate(hits: &[SearchHit], threshold: f32) -> GateDecision {
    match hits.first() {
        None => GateDecision::NoHits,
        Some(top) if accept(top.score, threshold) => GateDecision::Accepted,
        Some(top) => GateDecision::BelowThreshold {
            top_score: top.score,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary() {
        let threshold = 0.5;
        assert!(accept(threshold, threshold));
        assert!(!accept(threshold - f32::EPSILON, threshold));
        assert!(!accept(0.4999, threshold));
    }

    #[test]
    fn test_negative_logit_threshold() {
        assert!(accept(-0.5, -1.0));
        assert!(!accept(-1.5, -1.0));
    }

    #[test]
    fn test_evaluate_distinguishes_empty_from_low() {
        assert_eq!(evaluate(&[], 0.1), GateDecision::NoHits);

        let hits = vec![SearchHit::new("a", 0.2).unwrap()];
        assert_eq!(evaluate(&hits, 0.1), GateDecision::Accepted);
        assert_eq!(
            evaluate(&hits, 0.3),
            GateDecision::BelowThreshold { top_score: 0.2 }
        );
    }
}
