//! Ledger scenarios
//!
//! Stake-weighted finalization, slashing and the round lifecycle across
//! several rounds, driven through the public API only.

use dfln::{
    ConsensusLedger, Digest, LedgerConfig, LedgerError, NoQuorum, RoundStatus, ValidatorId,
    DEFAULT_SLASH_FRACTION, DEFAULT_SUPERMAJORITY,
};
use std::sync::Arc;

fn vid(s: &str) -> ValidatorId {
    ValidatorId::new(s).unwrap()
}

fn registered(stakes: &[(&str, f64)]) -> ConsensusLedger {
    let ledger = ConsensusLedger::new(LedgerConfig::default());
    for (id, stake) in stakes {
        ledger.register(vid(id), *stake).unwrap();
    }
    ledger
}

#[test]
fn test_defaults() {
    // Two thirds to finalize, 20% slashed
    assert!((DEFAULT_SUPERMAJORITY - 2.0 / 3.0).abs() < f64::EPSILON);
    assert_eq!(DEFAULT_SLASH_FRACTION, 0.2);
}

#[test]
fn test_equal_stake_one_dissenter() {
    let ledger = registered(&[("V1", 10.0), ("V2", 10.0), ("V3", 10.0)]);
    let honest = Digest([1; 32]);
    ledger.submit(1, vid("V1"), honest).unwrap();
    ledger.submit(1, vid("V2"), honest).unwrap();
    ledger.submit(1, vid("V3"), Digest([2; 32])).unwrap();

    let result = ledger.finalize(1).unwrap();
    assert_eq!(result.winning_digest, honest);
    assert!((result.stake_fraction - 2.0 / 3.0).abs() < 1e-12);
    assert_eq!(result.per_validator_digests.len(), 3);
    assert_eq!(result.slashed, vec![vid("V3")]);

    let accounts = ledger.accounts();
    assert_eq!(accounts[&vid("V1")].reputation, 1);
    assert_eq!(accounts[&vid("V2")].reputation, 1);
    assert_eq!(accounts[&vid("V3")].reputation, -1);
    assert_eq!(accounts[&vid("V3")].stake, 8.0);
}

#[test]
fn test_heavy_validator_alone_is_not_enough() {
    let ledger = registered(&[("V1", 10.0), ("V2", 5.0), ("V3", 5.0)]);
    let d1 = Digest([1; 32]);
    let d2 = Digest([2; 32]);
    ledger.submit(1, vid("V1"), d2).unwrap();
    ledger.submit(1, vid("V2"), d1).unwrap();
    ledger.submit(1, vid("V3"), d1).unwrap();
    let before = ledger.accounts();

    // D1 and D2 both weigh 10; the tie goes to D1, which still needs 13.3
    match ledger.finalize(1) {
        Err(NoQuorum::BelowThreshold { winning_digest, winning_weight, required, total_stake }) => {
            assert_eq!(winning_digest, d1);
            assert_eq!(winning_weight, 10.0);
            assert!((required - 40.0 / 3.0).abs() < 1e-9);
            assert_eq!(total_stake, 20.0);
        }
        other => panic!("expected no quorum, got {other:?}"),
    }
    assert_eq!(ledger.accounts(), before);
    assert_eq!(ledger.round_status(1), Some(RoundStatus::NoQuorum));
}

#[test]
fn test_repeat_offender_loses_influence() {
    let ledger = registered(&[("V1", 10.0), ("V2", 10.0), ("V3", 10.0)]);
    for round in 1..=5u64 {
        let honest = Digest([round as u8; 32]);
        ledger.submit(round, vid("V1"), honest).unwrap();
        ledger.submit(round, vid("V2"), honest).unwrap();
        ledger.submit(round, vid("V3"), Digest([0xee; 32])).unwrap();
        ledger.finalize(round).unwrap();
    }

    // 10 * 0.8^5
    assert!((ledger.stake(&vid("V3")) - 3.2768).abs() < 1e-9);
    assert_eq!(ledger.reputation(&vid("V3")), -5);
    assert_eq!(ledger.reputation(&vid("V1")), 5);
}

#[test]
fn test_unregistered_submitters_join_with_default_stake() {
    let ledger = ConsensusLedger::new(LedgerConfig::default());
    ledger.submit(3, vid("V1"), Digest([7; 32])).unwrap();
    ledger.submit(3, vid("V2"), Digest([7; 32])).unwrap();

    let result = ledger.finalize(3).unwrap();
    assert_eq!(result.total_stake, 2.0);
    assert_eq!(result.stake_fraction, 1.0);
}

#[test]
fn test_late_submission_after_finalization_rejected() {
    let ledger = registered(&[("V1", 1.0), ("V2", 1.0)]);
    ledger.submit(1, vid("V1"), Digest([1; 32])).unwrap();
    ledger.submit(1, vid("V2"), Digest([1; 32])).unwrap();
    let first = ledger.finalize(1).unwrap();

    let late = ledger.submit(1, vid("V2"), Digest([2; 32]));
    assert!(matches!(late, Err(LedgerError::RoundFinalized { round_id: 1 })));
    assert_eq!(ledger.finalize(1).unwrap().record_hash(), first.record_hash());
}

#[test]
fn test_register_between_rounds_changes_weights() {
    let ledger = registered(&[("V1", 1.0), ("V2", 1.0), ("V3", 1.0)]);
    ledger.register(vid("V3"), 10.0).unwrap();

    ledger.submit(1, vid("V1"), Digest([1; 32])).unwrap();
    ledger.submit(1, vid("V2"), Digest([1; 32])).unwrap();
    ledger.submit(1, vid("V3"), Digest([2; 32])).unwrap();

    // V3 alone holds 10 of 12
    let result = ledger.finalize(1).unwrap();
    assert_eq!(result.winning_digest, Digest([2; 32]));
    assert_eq!(result.slashed.len(), 2);
}

#[test]
fn test_concurrent_submitters() {
    let ledger = Arc::new(registered(&[("V1", 1.0), ("V2", 1.0), ("V3", 1.0), ("V4", 1.0)]));
    let handles: Vec<_> = ["V1", "V2", "V3", "V4"]
        .into_iter()
        .map(|id| {
            let ledger = Arc::clone(&ledger);
            std::thread::spawn(move || ledger.submit(9, vid(id), Digest([9; 32])))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let round = ledger.round(9).unwrap();
    assert_eq!(round.commitments.len(), 4);
    assert!(ledger.finalize(9).unwrap().slashed.is_empty());
}
