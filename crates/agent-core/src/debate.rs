use serde::{Deserialize, Serialize};

use crate::decision::{ActionType, DecisionResponse, TradingDecision};

/// How a multi-model debate resolves into final decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMode {
    MajorityVote,
    HighestConfidence,
    WeightedAverage,
    Unanimous,
}

impl ConsensusMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusMode::MajorityVote => "majority_vote",
            ConsensusMode::HighestConfidence => "highest_confidence",
            ConsensusMode::WeightedAverage => "weighted_average",
            ConsensusMode::Unanimous => "unanimous",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "majority_vote" => Some(ConsensusMode::MajorityVote),
            "highest_confidence" => Some(ConsensusMode::HighestConfidence),
            "weighted_average" => Some(ConsensusMode::WeightedAverage),
            "unanimous" => Some(ConsensusMode::Unanimous),
            _ => None,
        }
    }
}

impl Default for ConsensusMode {
    fn default() -> Self {
        ConsensusMode::MajorityVote
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateConfig {
    pub model_ids: Vec<String>,
    #[serde(default)]
    pub consensus_mode: ConsensusMode,
    #[serde(default = "default_min_participants")]
    pub min_participants: usize,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_min_participants() -> usize {
    2
}
fn default_timeout_seconds() -> u64 {
    120
}

impl DebateConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.model_ids.len() < 2 {
            return Err("at least 2 models required for debate".to_string());
        }
        if self.model_ids.len() > 5 {
            return Err("maximum 5 models allowed in debate".to_string());
        }
        if self.min_participants > self.model_ids.len() {
            return Err("min_participants cannot exceed number of models".to_string());
        }
        Ok(())
    }
}

/// One model's contribution to a debate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateParticipant {
    pub model_id: String,
    pub raw_response: String,
    pub chain_of_thought: String,
    pub market_assessment: String,
    pub decisions: Vec<TradingDecision>,
    pub overall_confidence: i64,
    pub latency_ms: i64,
    pub tokens_used: i64,
    pub error: Option<String>,
}

impl DebateParticipant {
    pub fn failed(model_id: impl Into<String>, latency_ms: i64, error: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            raw_response: String::new(),
            chain_of_thought: String::new(),
            market_assessment: String::new(),
            decisions: vec![],
            overall_confidence: 0,
            latency_ms,
            tokens_used: 0,
            error: Some(error.into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none() && !self.decisions.is_empty()
    }
}

/// Vote tally for one (symbol, action) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateVote {
    pub symbol: String,
    pub action: ActionType,
    pub vote_count: usize,
    pub total_confidence: i64,
    pub average_confidence: f64,
    pub voters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateResult {
    pub participants: Vec<DebateParticipant>,
    pub successful_participants: usize,
    pub failed_participants: usize,
    pub consensus_mode: ConsensusMode,
    pub min_participants: usize,
    pub votes: Vec<DebateVote>,
    /// Mean pairwise Jaccard similarity over non-passive (symbol, action) sets.
    pub agreement_score: f64,
    pub final_decisions: Vec<TradingDecision>,
    pub final_confidence: i64,
    pub consensus_reasoning: String,
    pub combined_market_assessment: String,
    pub combined_chain_of_thought: String,
    pub total_latency_ms: i64,
}

impl DebateResult {
    pub fn is_valid(&self) -> bool {
        self.successful_participants >= self.min_participants
    }

    pub fn to_decision_response(&self) -> DecisionResponse {
        DecisionResponse {
            chain_of_thought: self.combined_chain_of_thought.clone(),
            market_assessment: self.combined_market_assessment.clone(),
            decisions: self.final_decisions.clone(),
            overall_confidence: self.final_confidence,
            next_review_minutes: 60,
        }
    }
}
