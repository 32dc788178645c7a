//! End-to-end rounds
//!
//! Clients, validators and ledger wired together through the simulation and
//! the round engine.

use dfln::{
    AggregationMode, AnomalyRejection, Config, ConsensusOutcome, GateConfig, NoQuorum, PacketStatus,
    Rejection, Simulation, SimulationConfig, ValidatorId,
};

fn vid(s: &str) -> ValidatorId {
    ValidatorId::new(s).unwrap()
}

#[tokio::test]
async fn test_honest_federation_agrees() {
    let mut sim = Simulation::bootstrap(Config::default(), SimulationConfig::default()).unwrap();
    let report = sim.next_round().await.unwrap();
    let round = &report.round;

    assert_eq!(round.round_id, 1);
    let digests: Vec<_> = round.validators.iter().map(|s| s.commitment.digest).collect();
    assert!(digests.windows(2).all(|w| w[0] == w[1]));

    let result = round.consensus.result().unwrap();
    assert_eq!(result.winning_digest, digests[0]);
    assert_eq!(result.stake_fraction, 1.0);
    assert!(result.slashed.is_empty());
}

#[tokio::test]
async fn test_scaled_gradients_never_reach_aggregate() {
    let config = SimulationConfig {
        clients: 6,
        malicious_clients: 2,
        ..Default::default()
    };
    let mut sim = Simulation::bootstrap(Config::default(), config).unwrap();
    let report = sim.next_round().await.unwrap();

    for client in report.clients.iter().filter(|c| c.malicious) {
        assert!(client.grad_norm > 10.0);
    }
    for summary in &report.round.validators {
        assert_eq!(summary.admitted, 4);
        assert!(summary.commitment.aggregate_norm < 10.0);
        let rejected: Vec<_> = summary
            .outcomes
            .iter()
            .filter(|o| !o.is_admitted())
            .map(|o| o.client_id.as_str())
            .collect();
        assert_eq!(rejected, ["C5", "C6"]);
    }
}

#[tokio::test]
async fn test_forging_validator_slashed_each_round() {
    let config = SimulationConfig {
        validators: 4,
        malicious_validators: 1,
        ..Default::default()
    };
    let mut sim = Simulation::bootstrap(Config::default(), config).unwrap();
    let reports = sim.run(3).await.unwrap();

    for report in &reports {
        let result = report.round.consensus.result().unwrap();
        assert_eq!(result.slashed, vec![vid("V4")]);
        assert!(!report.round.summary(&vid("V4")).unwrap().is_honest());
    }

    let ledger = sim.ledger();
    assert_eq!(ledger.reputation(&vid("V1")), 3);
    assert_eq!(ledger.reputation(&vid("V4")), -3);
    assert!((ledger.stake(&vid("V4")) - 10.0 * 0.8f64.powi(3)).abs() < 1e-9);
}

#[tokio::test]
async fn test_forging_majority_blocks_finality() {
    let config = SimulationConfig {
        validators: 3,
        malicious_validators: 2,
        ..Default::default()
    };
    let mut sim = Simulation::bootstrap(Config::default(), config).unwrap();
    let before = sim.ledger().accounts();
    let report = sim.next_round().await.unwrap();

    assert!(matches!(
        report.round.consensus,
        ConsensusOutcome::NoQuorum { reason: NoQuorum::BelowThreshold { .. } }
    ));
    assert_eq!(sim.ledger().accounts(), before);
}

#[tokio::test]
async fn test_median_and_trimmed_mean_rounds() {
    for aggregation in [AggregationMode::Median, AggregationMode::TrimmedMean { trim_ratio: 0.2 }] {
        let engine_config = Config { aggregation, ..Default::default() };
        let config = SimulationConfig { clients: 5, ..Default::default() };
        let mut sim = Simulation::bootstrap(engine_config, config).unwrap();
        let report = sim.next_round().await.unwrap();
        assert_eq!(report.round.aggregation, aggregation);
        assert!(report.round.consensus.result().is_some());
    }
}

#[tokio::test]
async fn test_disabled_magnitude_check_lets_attack_through() {
    // Without the magnitude cutoff the mean is dragged far off
    let engine_config = Config {
        gate: GateConfig { norm_threshold: 1e6, ..Default::default() },
        ..Default::default()
    };
    let config = SimulationConfig {
        clients: 4,
        malicious_clients: 1,
        ..Default::default()
    };
    let mut sim = Simulation::bootstrap(engine_config, config).unwrap();
    let report = sim.next_round().await.unwrap();
    for summary in &report.round.validators {
        assert_eq!(summary.admitted, 4);
        assert!(summary.commitment.aggregate_norm > 10.0);
    }
}

#[tokio::test]
async fn test_rounds_advance_and_state_resets() {
    let mut sim = Simulation::bootstrap(Config::default(), SimulationConfig::default()).unwrap();
    let first = sim.next_round().await.unwrap();
    let second = sim.next_round().await.unwrap();

    assert_eq!(first.round.round_id, 1);
    assert_eq!(second.round.round_id, 2);
    // Admitted sets start empty every round
    for summary in &second.round.validators {
        assert_eq!(summary.admitted, 3);
    }
    assert_eq!(sim.ledger().reputation(&vid("V2")), 2);
}

#[tokio::test]
async fn test_report_serializes() {
    let config = SimulationConfig { malicious_clients: 1, ..Default::default() };
    let mut sim = Simulation::bootstrap(Config::default(), config).unwrap();
    let report = sim.next_round().await.unwrap();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["round"]["consensus"]["status"], "finalized");
    assert_eq!(json["round"]["validators"].as_array().unwrap().len(), 3);
    let outcome = &json["round"]["validators"][0]["outcomes"][2];
    assert_eq!(outcome["client_id"], "C3");
    assert_eq!(outcome["status"]["status"], "rejected");
    assert_eq!(outcome["status"]["reason"]["stage"], "anomaly");
    assert_eq!(outcome["status"]["reason"]["detail"]["kind"], "magnitude_exceeded");

    let rejection = match &report.round.validators[0].outcomes[2].status {
        PacketStatus::Rejected { reason } => reason.clone(),
        PacketStatus::Admitted { .. } => panic!("attacker admitted"),
    };
    assert!(matches!(rejection, Rejection::Anomaly(AnomalyRejection::MagnitudeExceeded { .. })));
}
