//! Worker personas and the model tiers they run on.
//!
//! Personas are a closed set, not string-keyed dispatch: each variant fixes
//! the model tier (and therefore the token pricing) a worker of that role
//! uses. Structural gate checks key off specific personas (`integrator`,
//! `reviewer`).

use serde::{Deserialize, Serialize};

/// The role an external worker plays for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persona {
    /// The orchestrating actor itself.
    King,
    Researcher,
    Analyst,
    Architect,
    Designer,
    Developer,
    /// Merges parallel implement-stage work; required by the gate when more
    /// than one implement task exists.
    Integrator,
    Debugger,
    Security,
    /// Required `done` before the verify gate opens.
    Reviewer,
    Tester,
    Qa,
    Docs,
    Devops,
}

impl Persona {
    pub fn as_str(&self) -> &'static str {
        match self {
            Persona::King => "king",
            Persona::Researcher => "researcher",
            Persona::Analyst => "analyst",
            Persona::Architect => "architect",
            Persona::Designer => "designer",
            Persona::Developer => "developer",
            Persona::Integrator => "integrator",
            Persona::Debugger => "debugger",
            Persona::Security => "security",
            Persona::Reviewer => "reviewer",
            Persona::Tester => "tester",
            Persona::Qa => "qa",
            Persona::Docs => "docs",
            Persona::Devops => "devops",
        }
    }

    /// Every persona in declaration order.
    pub fn all() -> &'static [Persona] {
        &[
            Persona::King,
            Persona::Researcher,
            Persona::Analyst,
            Persona::Architect,
            Persona::Designer,
            Persona::Developer,
            Persona::Integrator,
            Persona::Debugger,
            Persona::Security,
            Persona::Reviewer,
            Persona::Tester,
            Persona::Qa,
            Persona::Docs,
            Persona::Devops,
        ]
    }

    /// The model tier this persona runs on.
    pub fn model_tier(&self) -> ModelTier {
        match self {
            Persona::King => ModelTier::Opus,
            Persona::Researcher
            | Persona::Analyst
            | Persona::Architect
            | Persona::Designer
            | Persona::Developer
            | Persona::Integrator
            | Persona::Debugger
            | Persona::Security => ModelTier::Sonnet,
            Persona::Reviewer | Persona::Tester | Persona::Qa | Persona::Docs | Persona::Devops => {
                ModelTier::Haiku
            }
        }
    }
}

impl std::fmt::Display for Persona {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Persona {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Persona::all()
            .iter()
            .find(|p| p.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown persona '{}'", s))
    }
}

/// Pricing tiers, costed per million tokens (input, output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Opus,
    Sonnet,
    Haiku,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Opus => "opus",
            ModelTier::Sonnet => "sonnet",
            ModelTier::Haiku => "haiku",
        }
    }

    /// (input, output) USD per million tokens.
    pub fn cost_per_mtok(&self) -> (f64, f64) {
        match self {
            ModelTier::Opus => (15.0, 75.0),
            ModelTier::Sonnet => (3.0, 15.0),
            ModelTier::Haiku => (0.25, 1.25),
        }
    }

    /// USD cost of a concrete token count at this tier.
    pub fn cost_usd(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let (input_rate, output_rate) = self.cost_per_mtok();
        (input_tokens as f64 * input_rate + output_tokens as f64 * output_rate) / 1_000_000.0
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
