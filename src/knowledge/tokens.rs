//! Token accounting: a deterministic size measure and per-worker budgets.
//!
//! The estimator does not aim for parity with any model's tokenizer, only
//! for repeatability: identical input always measures identically, so
//! briefing bounds and budget thresholds behave the same across runs.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::persona::Persona;

/// Percentage thresholds at which a worker's budget emits a transition.
pub const BUDGET_THRESHOLDS: [u8; 3] = [50, 75, 90];

/// Estimate the token count of `text`.
///
/// Whitespace-delimited words floor the estimate; dense text without
/// whitespace still counts at roughly four bytes per token.
pub fn count_tokens(text: &str) -> u64 {
    let words = text.split_whitespace().count() as u64;
    let bytes = text.len() as u64;
    words.max(bytes.div_ceil(4))
}

/// Accumulated input/output token counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// Emitted when a worker's usage crosses a budget threshold for the first
/// time. Never re-fired at a stable level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetEvent {
    pub worker_id: String,
    pub threshold: u8,
    pub used: u64,
    pub budget: u64,
}

#[derive(Debug, Clone)]
struct WorkerLedger {
    persona: Option<Persona>,
    usage: TokenUsage,
    /// Thresholds already fired for this worker, in crossing order.
    fired: Vec<u8>,
}

/// Per-worker and aggregate token bookkeeping against a shared budget.
///
/// Threshold detection is edge-triggered: each of the fixed thresholds fires
/// at most once per worker, however usage arrives — three small increments
/// or one jump straight past all of them. Individual workers can be pinned
/// to their own budget; everyone else measures against the shared one.
#[derive(Debug, Clone)]
pub struct TokenLedger {
    budget: u64,
    overrides: BTreeMap<String, u64>,
    workers: BTreeMap<String, WorkerLedger>,
    total: TokenUsage,
}

impl TokenLedger {
    /// A ledger with the given per-worker budget. Zero disables thresholds.
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            overrides: BTreeMap::new(),
            workers: BTreeMap::new(),
            total: TokenUsage::default(),
        }
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Pin one worker to its own budget. Thresholds already fired stay
    /// fired; only future crossings measure against the new figure.
    pub fn set_budget_override(&mut self, worker_id: &str, budget: u64) {
        self.overrides.insert(worker_id.to_string(), budget);
    }

    fn budget_for(&self, worker_id: &str) -> u64 {
        self.overrides.get(worker_id).copied().unwrap_or(self.budget)
    }

    /// Record usage for a worker, returning the thresholds newly crossed.
    ///
    /// The persona is bound on first sight and kept thereafter; it drives
    /// the cost column in [`summary`](Self::summary).
    pub fn track_usage(
        &mut self,
        worker_id: &str,
        persona: Option<Persona>,
        input: u64,
        output: u64,
    ) -> Vec<BudgetEvent> {
        let budget = self.budget_for(worker_id);
        let entry = self
            .workers
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerLedger {
                persona,
                usage: TokenUsage::default(),
                fired: Vec::new(),
            });
        if entry.persona.is_none() {
            entry.persona = persona;
        }
        entry.usage.input += input;
        entry.usage.output += output;
        self.total.input += input;
        self.total.output += output;

        if budget == 0 {
            return Vec::new();
        }
        let used = entry.usage.total();
        let pct = used.saturating_mul(100) / budget;
        let mut events = Vec::new();
        for &threshold in &BUDGET_THRESHOLDS {
            if pct >= u64::from(threshold) && !entry.fired.contains(&threshold) {
                entry.fired.push(threshold);
                events.push(BudgetEvent {
                    worker_id: worker_id.to_string(),
                    threshold,
                    used,
                    budget,
                });
            }
        }
        events
    }

    pub fn worker_usage(&self, worker_id: &str) -> Option<TokenUsage> {
        self.workers.get(worker_id).map(|w| w.usage)
    }

    pub fn total_usage(&self) -> TokenUsage {
        self.total
    }

    pub fn summary(&self) -> TokenSummary {
        let mut workers = BTreeMap::new();
        let mut total_cost = 0.0;
        for (id, ledger) in &self.workers {
            let cost_usd = ledger
                .persona
                .map(|p| p.model_tier().cost_usd(ledger.usage.input, ledger.usage.output))
                .unwrap_or(0.0);
            total_cost += cost_usd;
            let budget = self.budget_for(id);
            let budget_pct = if budget == 0 {
                0
            } else {
                ledger.usage.total().saturating_mul(100) / budget
            };
            workers.insert(
                id.clone(),
                WorkerTokenReport {
                    persona: ledger.persona,
                    input: ledger.usage.input,
                    output: ledger.usage.output,
                    cost_usd,
                    budget_pct,
                },
            );
        }
        TokenSummary {
            budget: self.budget,
            total_input: self.total.input,
            total_output: self.total.output,
            total_cost_usd: total_cost,
            workers,
        }
    }
}

/// One worker's row in the token summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerTokenReport {
    pub persona: Option<Persona>,
    pub input: u64,
    pub output: u64,
    pub cost_usd: f64,
    pub budget_pct: u64,
}

/// Aggregate view for the query surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenSummary {
    pub budget: u64,
    pub total_input: u64,
    pub total_output: u64,
    pub total_cost_usd: f64,
    pub workers: BTreeMap<String, WorkerTokenReport>,
}
