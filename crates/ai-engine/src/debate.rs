//! Multi-model debate: fan identical prompts out to N models, then reduce
//! the responses to one decision set under the configured consensus mode.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_core::{
    ActionType, ConsensusMode, DebateConfig, DebateParticipant, DebateResult, DebateVote,
    RiskControls, TradingDecision,
};
use ai_client::AIClient;
use futures_util::future::join_all;

use crate::parser::DecisionParser;

pub struct DebateEngine {
    config: DebateConfig,
    parser: DecisionParser,
}

impl DebateEngine {
    pub fn new(config: DebateConfig, risk_controls: RiskControls) -> Self {
        Self {
            config,
            parser: DecisionParser::new(risk_controls),
        }
    }

    /// Run one debate round. Individual model failures are recorded on the
    /// participant and never abort the debate; the round is invalid only
    /// when fewer than `min_participants` models produced decisions.
    pub async fn run_debate(
        &self,
        clients: &[(String, Arc<dyn AIClient>)],
        system_prompt: &str,
        user_prompt: &str,
    ) -> DebateResult {
        let started = Instant::now();
        tracing::info!(
            models = clients.len(),
            mode = self.config.consensus_mode.as_str(),
            "starting debate"
        );

        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let tasks = clients.iter().map(|(model_id, client)| {
            self.generate_single(model_id.clone(), Arc::clone(client), system_prompt, user_prompt, timeout)
        });
        let participants = join_all(tasks).await;

        self.finalize(participants, started.elapsed())
    }

    async fn generate_single(
        &self,
        model_id: String,
        client: Arc<dyn AIClient>,
        system_prompt: &str,
        user_prompt: &str,
        timeout: Duration,
    ) -> DebateParticipant {
        let started = Instant::now();
        let generated =
            tokio::time::timeout(timeout, client.generate(system_prompt, user_prompt, true)).await;
        let latency_ms = started.elapsed().as_millis() as i64;

        let response = match generated {
            Err(_) => {
                tracing::warn!(%model_id, "debate participant timed out");
                return DebateParticipant::failed(
                    model_id,
                    latency_ms,
                    format!("Timeout after {}s", timeout.as_secs()),
                );
            }
            Ok(Err(e)) => {
                tracing::warn!(%model_id, "debate participant failed: {e}");
                return DebateParticipant::failed(model_id, latency_ms, format!("AI error: {e}"));
            }
            Ok(Ok(response)) => response,
        };

        match self.parser.parse(&response.content) {
            Ok(parsed) => DebateParticipant {
                model_id,
                raw_response: response.content,
                chain_of_thought: parsed.chain_of_thought,
                market_assessment: parsed.market_assessment,
                decisions: parsed.decisions,
                overall_confidence: parsed.overall_confidence,
                latency_ms,
                tokens_used: response.tokens_used,
                error: None,
            },
            Err(e) => {
                tracing::warn!(%model_id, "failed to parse debate response: {e}");
                DebateParticipant {
                    model_id,
                    raw_response: response.content,
                    chain_of_thought: String::new(),
                    market_assessment: String::new(),
                    decisions: vec![],
                    overall_confidence: 0,
                    latency_ms,
                    tokens_used: response.tokens_used,
                    error: Some(format!("Parse error: {e}")),
                }
            }
        }
    }

    /// Reduce collected participants into the final result. Split from
    /// `run_debate` so consensus logic is testable without clients.
    pub fn finalize(
        &self,
        participants: Vec<DebateParticipant>,
        elapsed: Duration,
    ) -> DebateResult {
        let successful: Vec<&DebateParticipant> =
            participants.iter().filter(|p| p.succeeded()).collect();
        let successful_count = successful.len();
        let failed_count = participants.len() - successful_count;
        tracing::info!(successful_count, failed_count, "debate responses collected");

        if successful_count < self.config.min_participants {
            let reason = "Not enough successful model responses";
            let total_latency: i64 = participants.iter().map(|p| p.latency_ms).sum();
            return DebateResult {
                participants,
                successful_participants: successful_count,
                failed_participants: failed_count,
                consensus_mode: self.config.consensus_mode,
                min_participants: self.config.min_participants,
                votes: vec![],
                agreement_score: 0.0,
                final_decisions: vec![],
                final_confidence: 0,
                consensus_reasoning: format!("Debate failed: {reason}"),
                combined_market_assessment: String::new(),
                combined_chain_of_thought: format!("Debate failed: {reason}"),
                total_latency_ms: total_latency,
            };
        }

        let votes = aggregate_votes(&successful);
        let agreement_score = agreement_score(&successful);
        let (final_decisions, consensus_reasoning) =
            self.apply_consensus(&successful, &votes, self.config.consensus_mode);
        let final_confidence =
            final_confidence(&successful, &final_decisions, self.config.consensus_mode);
        let combined_market_assessment = combine_assessments(&successful);
        let combined_chain_of_thought =
            combine_chain_of_thought(&participants, &consensus_reasoning);

        tracing::info!(
            agreement = agreement_score,
            decisions = final_decisions.len(),
            confidence = final_confidence,
            "debate completed"
        );

        DebateResult {
            successful_participants: successful_count,
            failed_participants: failed_count,
            consensus_mode: self.config.consensus_mode,
            min_participants: self.config.min_participants,
            votes,
            agreement_score,
            final_decisions,
            final_confidence,
            consensus_reasoning,
            combined_market_assessment,
            combined_chain_of_thought,
            total_latency_ms: elapsed.as_millis() as i64,
            participants,
        }
    }

    fn apply_consensus(
        &self,
        participants: &[&DebateParticipant],
        votes: &[DebateVote],
        mode: ConsensusMode,
    ) -> (Vec<TradingDecision>, String) {
        match mode {
            ConsensusMode::MajorityVote => majority_vote(participants, votes),
            ConsensusMode::HighestConfidence => highest_confidence(participants),
            ConsensusMode::WeightedAverage => weighted_average(participants),
            ConsensusMode::Unanimous => unanimous(participants, votes),
        }
    }
}

fn aggregate_votes(participants: &[&DebateParticipant]) -> Vec<DebateVote> {
    let mut map: HashMap<(String, ActionType), DebateVote> = HashMap::new();
    for participant in participants {
        for decision in &participant.decisions {
            let vote = map
                .entry((decision.symbol.clone(), decision.action))
                .or_insert_with(|| DebateVote {
                    symbol: decision.symbol.clone(),
                    action: decision.action,
                    vote_count: 0,
                    total_confidence: 0,
                    average_confidence: 0.0,
                    voters: vec![],
                });
            vote.vote_count += 1;
            vote.total_confidence += decision.confidence;
            vote.voters.push(participant.model_id.clone());
        }
    }

    let mut votes: Vec<DebateVote> = map.into_values().collect();
    for vote in &mut votes {
        if vote.vote_count > 0 {
            vote.average_confidence = vote.total_confidence as f64 / vote.vote_count as f64;
        }
    }
    votes.sort_by(|a, b| {
        (b.vote_count, b.average_confidence)
            .partial_cmp(&(a.vote_count, a.average_confidence))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    votes
}

/// Mean pairwise Jaccard similarity over the participants' non-passive
/// (symbol, action) sets. Two empty sets agree perfectly.
fn agreement_score(participants: &[&DebateParticipant]) -> f64 {
    if participants.len() < 2 {
        return 1.0;
    }
    let sets: Vec<std::collections::HashSet<(String, ActionType)>> = participants
        .iter()
        .map(|p| {
            p.decisions
                .iter()
                .filter(|d| !d.action.is_passive())
                .map(|d| (d.symbol.clone(), d.action))
                .collect()
        })
        .collect();

    if sets.iter().all(|s| s.is_empty()) {
        return 1.0;
    }

    let mut similarities = Vec::new();
    for i in 0..sets.len() {
        for j in i + 1..sets.len() {
            let (a, b) = (&sets[i], &sets[j]);
            let similarity = if a.is_empty() && b.is_empty() {
                1.0
            } else if a.is_empty() || b.is_empty() {
                0.0
            } else {
                let intersection = a.intersection(b).count() as f64;
                let union = a.union(b).count() as f64;
                if union > 0.0 {
                    intersection / union
                } else {
                    0.0
                }
            };
            similarities.push(similarity);
        }
    }
    similarities.iter().sum::<f64>() / similarities.len() as f64
}

fn find_decision<'a>(
    participants: &'a [&DebateParticipant],
    symbol: &str,
    action: ActionType,
) -> Option<&'a TradingDecision> {
    participants
        .iter()
        .flat_map(|p| p.decisions.iter())
        .find(|d| d.symbol == symbol && d.action == action)
}

fn majority_vote(
    participants: &[&DebateParticipant],
    votes: &[DebateVote],
) -> (Vec<TradingDecision>, String) {
    let mut final_decisions = Vec::new();
    let mut reasoning = vec!["Consensus by majority vote:".to_string()];

    let mut by_symbol: HashMap<&str, Vec<&DebateVote>> = HashMap::new();
    for vote in votes {
        by_symbol.entry(vote.symbol.as_str()).or_default().push(vote);
    }

    let mut symbols: Vec<&&str> = by_symbol.keys().collect();
    symbols.sort();
    for symbol in symbols {
        let symbol_votes = &by_symbol[*symbol];
        let winner = symbol_votes
            .iter()
            .max_by(|a, b| {
                (a.vote_count, a.average_confidence)
                    .partial_cmp(&(b.vote_count, b.average_confidence))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("non-empty vote group");
        let total_votes: usize = symbol_votes.iter().map(|v| v.vote_count).sum();

        // Strict majority only.
        if winner.vote_count * 2 > total_votes {
            if let Some(template) = find_decision(participants, *symbol, winner.action) {
                let mut decision = template.clone();
                decision.confidence = winner.average_confidence as i64;
                final_decisions.push(decision);
                reasoning.push(format!(
                    "- {symbol} {}: {}/{} votes (avg confidence: {:.0}%)",
                    winner.action.as_str(),
                    winner.vote_count,
                    total_votes,
                    winner.average_confidence
                ));
            }
        }
    }

    (final_decisions, reasoning.join("\n"))
}

fn highest_confidence(participants: &[&DebateParticipant]) -> (Vec<TradingDecision>, String) {
    let winner = participants
        .iter()
        .max_by_key(|p| p.overall_confidence)
        .expect("non-empty participants");
    (
        winner.decisions.clone(),
        format!(
            "Consensus by highest confidence: {} with {}% confidence",
            winner.model_id, winner.overall_confidence
        ),
    )
}

fn weighted_average(participants: &[&DebateParticipant]) -> (Vec<TradingDecision>, String) {
    let mut final_decisions = Vec::new();
    let mut reasoning = vec!["Consensus by weighted confidence:".to_string()];

    // weight = participant overall confidence x decision confidence / 100
    let mut by_symbol: HashMap<String, HashMap<ActionType, (f64, TradingDecision)>> =
        HashMap::new();
    for participant in participants {
        let weight = participant.overall_confidence as f64;
        for decision in &participant.decisions {
            let entry = by_symbol
                .entry(decision.symbol.clone())
                .or_default()
                .entry(decision.action)
                .or_insert_with(|| (0.0, decision.clone()));
            entry.0 += weight * decision.confidence as f64 / 100.0;
        }
    }

    let mut symbols: Vec<&String> = by_symbol.keys().collect();
    symbols.sort();
    for symbol in symbols {
        let actions = &by_symbol[symbol];
        if let Some((action, (weight, decision))) = actions
            .iter()
            .max_by(|a, b| a.1 .0.partial_cmp(&b.1 .0).unwrap_or(std::cmp::Ordering::Equal))
        {
            if !action.is_passive() {
                final_decisions.push(decision.clone());
                reasoning.push(format!(
                    "- {symbol} {}: weighted score {weight:.1}",
                    action.as_str()
                ));
            }
        }
    }

    (final_decisions, reasoning.join("\n"))
}

fn unanimous(
    participants: &[&DebateParticipant],
    votes: &[DebateVote],
) -> (Vec<TradingDecision>, String) {
    let mut final_decisions = Vec::new();
    let mut reasoning = vec!["Consensus by unanimous agreement:".to_string()];
    let count = participants.len();

    for vote in votes {
        if vote.vote_count == count {
            if let Some(template) = find_decision(participants, &vote.symbol, vote.action) {
                let mut decision = template.clone();
                decision.confidence = vote.average_confidence as i64;
                final_decisions.push(decision);
                reasoning.push(format!(
                    "- {} {}: unanimous ({count}/{count})",
                    vote.symbol,
                    vote.action.as_str()
                ));
            }
        }
    }
    if final_decisions.is_empty() {
        reasoning.push("- No unanimous agreement reached, defaulting to hold".to_string());
    }

    (final_decisions, reasoning.join("\n"))
}

fn final_confidence(
    participants: &[&DebateParticipant],
    final_decisions: &[TradingDecision],
    mode: ConsensusMode,
) -> i64 {
    if participants.is_empty() {
        return 0;
    }
    if mode == ConsensusMode::HighestConfidence {
        return participants.iter().map(|p| p.overall_confidence).max().unwrap_or(0);
    }
    if final_decisions.is_empty() {
        return participants.iter().map(|p| p.overall_confidence).min().unwrap_or(0);
    }
    let sum: i64 = final_decisions.iter().map(|d| d.confidence).sum();
    sum / final_decisions.len() as i64
}

fn combine_assessments(participants: &[&DebateParticipant]) -> String {
    let mut parts = vec!["## Combined Market Assessment\n".to_string()];
    for p in participants {
        if !p.market_assessment.is_empty() {
            parts.push(format!("### {}\n{}\n", p.model_id, p.market_assessment));
        }
    }
    parts.join("\n")
}

fn combine_chain_of_thought(participants: &[DebateParticipant], consensus: &str) -> String {
    let mut parts = vec![
        "## Multi-Model Debate Analysis\n".to_string(),
        format!(
            "**Participants:** {}\n",
            participants
                .iter()
                .map(|p| p.model_id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        "### Consensus Result\n".to_string(),
        consensus.to_string(),
        "\n\n### Individual Model Reasoning\n".to_string(),
    ];
    for p in participants {
        if !p.chain_of_thought.is_empty() {
            let mut cot: String = p.chain_of_thought.chars().take(500).collect();
            if cot.len() < p.chain_of_thought.len() {
                cot.push_str("...");
            }
            parts.push(format!(
                "#### {} (confidence: {}%)\n{}\n\n",
                p.model_id, p.overall_confidence, cot
            ));
        }
    }
    parts.join("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(symbol: &str, action: ActionType, confidence: i64) -> TradingDecision {
        TradingDecision {
            symbol: symbol.to_string(),
            action,
            leverage: 1,
            position_size_usd: 100.0,
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            confidence,
            risk_usd: 0.0,
            reasoning: "test decision".to_string(),
        }
    }

    fn participant(
        model: &str,
        overall: i64,
        decisions: Vec<TradingDecision>,
    ) -> DebateParticipant {
        DebateParticipant {
            model_id: model.to_string(),
            raw_response: "{}".to_string(),
            chain_of_thought: format!("{model} thinking"),
            market_assessment: String::new(),
            decisions,
            overall_confidence: overall,
            latency_ms: 10,
            tokens_used: 100,
            error: None,
        }
    }

    fn engine(mode: ConsensusMode) -> DebateEngine {
        DebateEngine::new(
            DebateConfig {
                model_ids: vec!["a".into(), "b".into(), "c".into()],
                consensus_mode: mode,
                min_participants: 2,
                timeout_seconds: 120,
            },
            RiskControls::default(),
        )
    }

    #[test]
    fn majority_vote_picks_two_of_three() {
        let participants = vec![
            participant("m1", 80, vec![decision("BTC", ActionType::OpenLong, 80)]),
            participant("m2", 70, vec![decision("BTC", ActionType::OpenLong, 60)]),
            participant("m3", 60, vec![decision("BTC", ActionType::Hold, 50)]),
        ];
        let result = engine(ConsensusMode::MajorityVote)
            .finalize(participants, Duration::from_millis(5));

        assert!(result.is_valid());
        assert_eq!(result.final_decisions.len(), 1);
        let d = &result.final_decisions[0];
        assert_eq!(d.symbol, "BTC");
        assert_eq!(d.action, ActionType::OpenLong);
        // avg(80, 60) = 70
        assert_eq!(d.confidence, 70);

        // Pairwise Jaccard over non-passive sets: (m1,m2)=1, (m1,m3)=0,
        // (m2,m3)=0 -> 1/3.
        assert!((result.agreement_score - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn majority_requires_strict_majority() {
        let participants = vec![
            participant("m1", 80, vec![decision("BTC", ActionType::OpenLong, 80)]),
            participant("m2", 70, vec![decision("BTC", ActionType::OpenShort, 75)]),
        ];
        let result = engine(ConsensusMode::MajorityVote)
            .finalize(participants, Duration::from_millis(5));
        // 1/2 votes each: no strict majority, no decision.
        assert!(result.final_decisions.is_empty());
    }

    #[test]
    fn highest_confidence_takes_winner_wholesale() {
        let participants = vec![
            participant(
                "m1",
                90,
                vec![
                    decision("BTC", ActionType::OpenLong, 85),
                    decision("ETH", ActionType::CloseLong, 80),
                ],
            ),
            participant("m2", 60, vec![decision("BTC", ActionType::Hold, 55)]),
        ];
        let result = engine(ConsensusMode::HighestConfidence)
            .finalize(participants, Duration::from_millis(5));
        assert_eq!(result.final_decisions.len(), 2);
        assert_eq!(result.final_confidence, 90);
        assert!(result.consensus_reasoning.contains("m1"));
    }

    #[test]
    fn weighted_average_skips_passive_winners() {
        let participants = vec![
            participant("m1", 90, vec![decision("BTC", ActionType::Hold, 95)]),
            participant("m2", 80, vec![decision("BTC", ActionType::Hold, 90)]),
            participant("m3", 40, vec![decision("BTC", ActionType::OpenLong, 50)]),
        ];
        let result = engine(ConsensusMode::WeightedAverage)
            .finalize(participants, Duration::from_millis(5));
        // Hold wins the weighting but passive actions never execute.
        assert!(result.final_decisions.is_empty());
    }

    #[test]
    fn weighted_average_picks_heaviest_action() {
        let participants = vec![
            participant("m1", 90, vec![decision("BTC", ActionType::OpenLong, 90)]),
            participant("m2", 50, vec![decision("BTC", ActionType::OpenShort, 60)]),
            participant("m3", 60, vec![decision("BTC", ActionType::OpenLong, 70)]),
        ];
        let result = engine(ConsensusMode::WeightedAverage)
            .finalize(participants, Duration::from_millis(5));
        assert_eq!(result.final_decisions.len(), 1);
        assert_eq!(result.final_decisions[0].action, ActionType::OpenLong);
    }

    #[test]
    fn unanimous_requires_everyone() {
        let participants = vec![
            participant("m1", 80, vec![decision("BTC", ActionType::OpenLong, 80)]),
            participant("m2", 70, vec![decision("BTC", ActionType::OpenLong, 70)]),
            participant("m3", 60, vec![decision("BTC", ActionType::OpenLong, 60)]),
        ];
        let result = engine(ConsensusMode::Unanimous)
            .finalize(participants, Duration::from_millis(5));
        assert_eq!(result.final_decisions.len(), 1);
        assert_eq!(result.final_decisions[0].confidence, 70);

        let participants = vec![
            participant("m1", 80, vec![decision("BTC", ActionType::OpenLong, 80)]),
            participant("m2", 70, vec![decision("BTC", ActionType::OpenLong, 70)]),
            participant("m3", 60, vec![decision("BTC", ActionType::Hold, 60)]),
        ];
        let result = engine(ConsensusMode::Unanimous)
            .finalize(participants, Duration::from_millis(5));
        assert!(result.final_decisions.is_empty());
        assert!(result.consensus_reasoning.contains("No unanimous agreement"));
    }

    #[test]
    fn too_few_successes_invalidates_debate() {
        let participants = vec![
            participant("m1", 80, vec![decision("BTC", ActionType::OpenLong, 80)]),
            DebateParticipant::failed("m2", 5, "Timeout after 120s"),
            DebateParticipant::failed("m3", 5, "AI error: connection refused"),
        ];
        let result = engine(ConsensusMode::MajorityVote)
            .finalize(participants, Duration::from_millis(5));
        assert!(!result.is_valid());
        assert!(result.final_decisions.is_empty());
        assert!(result.consensus_reasoning.contains("Debate failed"));
        assert_eq!(result.successful_participants, 1);
        assert_eq!(result.failed_participants, 2);
    }

    #[test]
    fn all_hold_counts_as_full_agreement() {
        let participants = vec![
            participant("m1", 60, vec![decision("BTC", ActionType::Hold, 60)]),
            participant("m2", 55, vec![decision("BTC", ActionType::Wait, 50)]),
        ];
        let result = engine(ConsensusMode::MajorityVote)
            .finalize(participants, Duration::from_millis(5));
        assert!((result.agreement_score - 1.0).abs() < 1e-9);
    }
}
