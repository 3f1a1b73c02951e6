//! Token pricing.
//!
//! The per-model price table is operator-supplied configuration (the spec
//! deliberately does not bake one in). Costs are integer cents, rounded
//! half-up, so totals aggregate without float drift.

use std::collections::HashMap;

use cf_core::config::ModelPrice;

#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    rates: HashMap<String, (f64, f64)>,
}

impl PriceTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_config(prices: &[ModelPrice]) -> Self {
        let rates = prices
            .iter()
            .map(|p| {
                (
                    p.model.clone(),
                    (p.input_cents_per_1k, p.output_cents_per_1k),
                )
            })
            .collect();
        Self { rates }
    }

    /// Cost in cents for one completion. Unknown models cost zero and log
    /// a warning once per call site.
    pub fn cost_cents(&self, model: &str, tokens_in: u64, tokens_out: u64) -> i64 {
        match self.rates.get(model) {
            Some((input_rate, output_rate)) => {
                let cost = (tokens_in as f64 / 1000.0) * input_rate
                    + (tokens_out as f64 / 1000.0) * output_rate;
                cost.round() as i64
            }
            None => {
                tracing::warn!(model, "no price configured for model, recording zero cost");
                0
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
