//! Content-quality scoring behind an injectable seam.
//!
//! The default scorer is heuristic: it rewards filled-in, reasonably rich
//! JSON structures without understanding the prose. Deployments that want
//! model judgment implement [`ContentScorer`] and inject it into the gate.

use crate::agent::AgentOutput;
use crate::phase::PhaseSpec;
use serde_json::Value;

/// Phase-specific content quality, 0.0 to 1.0.
pub trait ContentScorer: Send + Sync {
    fn score_content(&self, spec: &PhaseSpec, output: &AgentOutput) -> f64;
}

/// Structure-based heuristic scorer.
///
/// Scores the ratio of non-empty leaves plus a richness factor that saturates
/// at a modest leaf count, so a sparse `{"genre": "fantasy"}` scores below a
/// filled-out phase output but nothing requires novel-length payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicScorer;

impl ContentScorer for HeuristicScorer {
    fn score_content(&self, _spec: &PhaseSpec, output: &AgentOutput) -> f64 {
        let (leaves, filled) = count_leaves(&output.content);
        // No substance at all (null, empty strings, empty containers) is
        // worth nothing regardless of structural richness.
        if filled == 0 {
            return 0.0;
        }
        let filled_ratio = filled as f64 / leaves as f64;
        let richness = (leaves as f64 / 6.0).min(1.0);
        (0.7 * filled_ratio + 0.3 * richness).clamp(0.0, 1.0)
    }
}

/// Count (total, non-empty) leaf values in a JSON tree.
fn count_leaves(value: &Value) -> (usize, usize) {
    match value {
        Value::Object(map) => map.values().map(count_leaves).fold((0, 0), sum2),
        Value::Array(items) => items.iter().map(count_leaves).fold((0, 0), sum2),
        Value::Null => (1, 0),
        Value::String(s) => (1, usize::from(!s.trim().is_empty())),
        _ => (1, 1),
    }
}

fn sum2(a: (usize, usize), b: (usize, usize)) -> (usize, usize) {
    (a.0 + b.0, a.1 + b.1)
}
