//! Consensus voting over parallel provider executions.
//!
//! The engine does not decide what "correct" means: it groups answers,
//! applies the `require` rule, and surfaces the agreement structurally.
//! Downstream steps (or a human, when `requires_human` is set) interpret a
//! LOW-agreement outcome.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, WeftError};

/// Agreement level surfaced in the step output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Agreement {
    High,
    Low,
}

/// One execution's answer (or failure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAnswer {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The synthesized verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    pub agreement: Agreement,
    /// The shared answer when consensus was reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub answers: Vec<ProviderAnswer>,
    pub requires_human: bool,
    pub rule: String,
}

impl ConsensusOutcome {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// The `require` rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequireRule {
    Unanimous,
    Majority,
    /// At least `need` of `out_of` answers must agree.
    Fraction { need: usize, out_of: usize },
}

impl RequireRule {
    pub fn parse(rule: &str) -> Result<Self, WeftError> {
        let trimmed = rule.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "unanimous" => return Ok(Self::Unanimous),
            "majority" => return Ok(Self::Majority),
            _ => {}
        }
        if let Some((need, out_of)) = trimmed.split_once('/') {
            let need: usize = need.trim().parse().map_err(|_| bad_rule(rule))?;
            let out_of: usize = out_of.trim().parse().map_err(|_| bad_rule(rule))?;
            if need == 0 || out_of == 0 || need > out_of {
                return Err(bad_rule(rule));
            }
            return Ok(Self::Fraction { need, out_of });
        }
        Err(bad_rule(rule))
    }

    /// Votes needed to reach consensus among `total` answers.
    fn threshold(&self, total: usize) -> usize {
        match self {
            Self::Unanimous => total,
            Self::Majority => total / 2 + 1,
            Self::Fraction { need, out_of } => {
                // Scale the fraction onto the actual answer count, rounding up.
                (need * total).div_ceil(*out_of)
            }
        }
    }
}

fn bad_rule(rule: &str) -> WeftError {
    WeftError::new(
        ErrorCode::ConfigInvalid,
        format!("unrecognized consensus rule {rule:?} (use \"unanimous\", \"majority\", or \"N/M\")"),
    )
}

/// Groups answers (case-insensitive, trimmed) and applies the rule.
pub fn evaluate(rule_text: &str, answers: Vec<ProviderAnswer>) -> Result<ConsensusOutcome, WeftError> {
    let rule = RequireRule::parse(rule_text)?;
    let usable: Vec<&ProviderAnswer> = answers.iter().filter(|a| a.answer.is_some()).collect();
    let total = usable.len();

    let mut groups: Vec<(String, usize, String)> = Vec::new(); // (key, count, representative)
    for entry in &usable {
        let answer = entry.answer.as_deref().unwrap_or_default();
        let key = answer.trim().to_lowercase();
        match groups.iter_mut().find(|(k, _, _)| *k == key) {
            Some((_, count, _)) => *count += 1,
            None => groups.push((key, 1, answer.trim().to_string())),
        }
    }
    groups.sort_by(|a, b| b.1.cmp(&a.1));

    let reached = match groups.first() {
        Some((_, count, _)) if total > 0 => *count >= rule.threshold(total),
        _ => false,
    };

    if reached {
        let (_, _, representative) = groups.into_iter().next().unwrap_or_default();
        Ok(ConsensusOutcome {
            agreement: Agreement::High,
            answer: Some(representative),
            answers,
            requires_human: false,
            rule: rule_text.to_string(),
        })
    } else {
        Ok(ConsensusOutcome {
            agreement: Agreement::Low,
            answer: None,
            answers,
            requires_human: true,
            rule: rule_text.to_string(),
        })
    }
}
