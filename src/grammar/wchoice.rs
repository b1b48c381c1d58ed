use rand::Rng;

use crate::grammar::SymbolId;

/// Cumulative-weight sampler backing every choice symbol.
///
/// Branches are ordered sequences of symbol ids so that the same branch list
/// can be shared between a grammar and its cracked siblings.
#[derive(Clone, Debug, Default)]
pub(crate) struct WeightedChoice {
    pub(crate) total: f64,
    pub(crate) values: Vec<Vec<SymbolId>>,
    pub(crate) weights: Vec<f64>,
}

impl WeightedChoice {
    pub(crate) fn append(&mut self, value: Vec<SymbolId>, weight: f64) {
        self.total += weight;
        self.values.push(value);
        self.weights.push(weight);
    }

    /// Sample a branch index: draw `u ~ Uniform(0, total)` and subtract branch
    /// weights in order until the remainder goes negative. `None` when there is
    /// no weight to sample from.
    pub(crate) fn choose<R: Rng>(&self, rng: &mut R) -> Option<usize> {
        if !(self.total > 0.0) {
            return None;
        }
        let mut target = rng.gen_range(0.0..self.total);
        for (i, weight) in self.weights.iter().enumerate() {
            target -= weight;
            if target < 0.0 {
                return Some(i);
            }
        }
        // float round-off can leave a sliver of the draw unaccounted for
        self.weights.iter().rposition(|w| *w > 0.0)
    }

    pub(crate) fn recompute_total(&mut self) {
        self.total = self.weights.iter().sum();
    }
}
