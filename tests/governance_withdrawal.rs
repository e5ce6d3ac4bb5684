use silo_gov::{
    AccountId, ChangePayload, GovernanceParams, InMemoryBank, Protocol, ProtocolConfig,
    RecordingExecutor, VoteWeighting,
};

fn user() -> AccountId {
    "user".to_string()
}

fn owner() -> AccountId {
    "owner".to_string()
}

/// Owner and user each hold 500 seeds and 1 000 000 stalk; the owner raises
/// five proposals, the user votes on #1 and then gives back half its stalk.
fn setup(weighting: VoteWeighting) -> Protocol {
    let config = ProtocolConfig {
        governance: GovernanceParams {
            vote_weighting: weighting,
            min_voting_epochs: 10,
            ..GovernanceParams::default()
        },
        ..ProtocolConfig::default()
    };
    let mut protocol = Protocol::new(&config, InMemoryBank::new(), RecordingExecutor::new());
    protocol.advance_epoch(2, 0).unwrap();
    protocol.add_silo_assets(&user(), 500, 1_000_000).unwrap();
    protocol.add_silo_assets(&owner(), 500, 1_000_000).unwrap();

    for expected in 0..5 {
        let id = protocol
            .propose(&owner(), ChangePayload::new(b"upgrade".to_vec()), None)
            .unwrap();
        assert_eq!(id, expected);
    }
    protocol.vote(&user(), 1).unwrap();
    protocol.remove_silo_assets(&user(), 500, 500_000).unwrap();
    protocol.check_invariants().unwrap();
    protocol
}

#[test]
fn vote_counters_follow_roots() {
    let protocol = setup(VoteWeighting::Live);
    let owner_roots = protocol.balance_of_roots(&owner());
    assert_eq!(protocol.roots_for(0).unwrap(), owner_roots);
    assert_eq!(protocol.roots_for(1).unwrap(), protocol.total_roots());
    assert_eq!(protocol.roots_for(2).unwrap(), owner_roots);
    assert_eq!(protocol.roots_for(3).unwrap(), owner_roots);
}

#[test]
fn withdrawal_removes_stalk() {
    let protocol = setup(VoteWeighting::Live);
    assert_eq!(protocol.balance_of_stalk(&user()), 500_000);
}

#[test]
fn one_deposit_and_withdrawal() {
    let mut protocol = setup(VoteWeighting::Live);
    protocol.add_silo_assets(&user(), 500, 1_000_000).unwrap();
    protocol.remove_silo_assets(&user(), 500, 1_000_000).unwrap();
    assert_eq!(protocol.balance_of_stalk(&user()), 500_000);
    assert_eq!(protocol.roots_for(1).unwrap(), protocol.total_roots());
}

#[test]
fn many_deposits_and_withdrawals() {
    let mut protocol = setup(VoteWeighting::Live);
    protocol.add_silo_assets(&user(), 500, 1_000_000).unwrap();
    protocol.add_silo_assets(&user(), 1_000, 1_000_000).unwrap();
    for _ in 0..3 {
        protocol.remove_silo_assets(&user(), 500, 500_000).unwrap();
    }
    assert_eq!(protocol.roots_for(1).unwrap(), protocol.total_roots());
    assert_eq!(protocol.balance_of_stalk(&user()), 1_000_000);
    protocol.check_invariants().unwrap();
}

#[test]
fn proposer_withdraws_below_the_proposal_threshold() {
    let mut protocol = setup(VoteWeighting::Live);
    protocol.remove_silo_assets(&owner(), 500, 500_000).unwrap();
    assert_eq!(protocol.balance_of_stalk(&user()), 500_000);
    assert_eq!(
        protocol.roots_for(0).unwrap(),
        protocol.balance_of_roots(&owner())
    );
}

#[test]
fn supply_growth_leaves_roots_alone() {
    let mut protocol = setup(VoteWeighting::Live);
    let roots = protocol.total_roots();
    protocol.advance_epoch(3, 1_000_000).unwrap();
    assert_eq!(protocol.total_roots(), roots);
    assert_eq!(protocol.roots_for(1).unwrap(), protocol.total_roots());
    protocol.check_invariants().unwrap();
}

#[test]
fn proposals_stay_active() {
    let protocol = setup(VoteWeighting::Live);
    assert_eq!(protocol.active_bips(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn vote_is_recorded() {
    let protocol = setup(VoteWeighting::Live);
    assert!(protocol.voted(&user(), 1));
    assert!(!protocol.voted(&user(), 0));
    assert!(protocol.voted(&owner(), 4));
}

#[test]
fn snapshot_weighting_keeps_cast_weight() {
    let mut protocol = setup(VoteWeighting::Snapshot);
    assert_eq!(protocol.roots_for(1).unwrap(), 2_000_000);
    assert!(protocol.roots_for(1).unwrap() > protocol.total_roots());
    assert_eq!(protocol.balance_of_stalk(&user()), 500_000);

    protocol.remove_silo_assets(&owner(), 500, 500_000).unwrap();
    assert_eq!(protocol.roots_for(0).unwrap(), 1_000_000);
    assert_eq!(protocol.balance_of_roots(&owner()), 500_000);
    assert_eq!(protocol.active_bips(), vec![0, 1, 2, 3, 4]);
}
