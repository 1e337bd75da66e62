//! Integration tests for the full sync pipeline
//!
//! Tests cover:
//! - Fail-fast configuration checks before any network call
//! - Idempotent reruns and monotonic checkpoints
//! - Vault vendor attribution through the pricing router
//! - Additive merge across rechecks
//! - Gap tracking and recovery
//! - Source-scoped and fatal failures

mod common;

use common::*;
use ethers::types::Address;
use itertools::Itertools;
use oracle_sync_sdk::error::{RpcError, SyncError};
use oracle_sync_sdk::types::{EntityKind, EventKind, EventPayload};
use oracle_sync_sdk::vendor_attributor::{vendors_for_asset, vendors_for_vault, VendorClassification};
use std::collections::BTreeSet;

#[tokio::test]
async fn test_cold_start_without_start_block_fails_before_network() {
    let factories = vec![
        factory("routers", addr(ROUTER_FACTORY), EntityKind::Router, None),
        factory("vaults", addr(VAULT_FACTORY), EntityKind::Vault, Some(1_000)),
    ];
    let mut harness = Harness::new(scenario(10_000), factories);

    match harness.orchestrator.run_once().await {
        Err(SyncError::Configuration { setting, .. }) => {
            assert_eq!(setting, "factories.routers.start_block")
        }
        other => panic!("expected configuration error, got {:?}", other.map(|r| r.head)),
    }
    assert_eq!(harness.chain.height_requests(), 0);
    assert!(harness.chain.queries().is_empty());
    assert!(harness.stored_bytes().is_empty());
}

#[tokio::test]
async fn test_full_run_discovers_and_attributes() {
    let mut harness = Harness::new(scenario(10_000), default_factories());
    let report = harness.orchestrator.run_once().await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.new_deployments(), 2);
    assert_eq!(report.entities.processed, 2);
    assert_eq!(report.entities.events.config_set, 3);

    let progress = harness.stored_progress();
    assert_eq!(progress.sources["routers"].last_synced_block, Some(10_000));
    assert_eq!(progress.sources["vaults"].last_synced_block, Some(10_000));

    let router = &progress.entities[&addr(ROUTER)];
    assert_eq!(router.last_processed_block, Some(10_000));
    assert_eq!(
        router.facts.vendors[&addr(CHAINLINK_ADAPTER)],
        VendorClassification::external("Chainlink")
    );
    assert_eq!(
        router.facts.vendors[&addr(CROSS_ADAPTER)],
        VendorClassification::CompositeVendor {
            leg_a: "Pyth".to_string(),
            leg_b: "Chronicle".to_string()
        }
    );
    assert_eq!(router.facts.vendors[&addr(VAULT)], VendorClassification::Vault);

    let vendors = vendors_for_asset(&router.facts, addr(ASSET))
        .into_iter()
        .collect_vec();
    assert_eq!(vendors, vec!["Chainlink", "Chronicle", "Pyth"]);

    let vault = &progress.entities[&addr(VAULT)];
    assert!(vault.facts.oracle_routers.contains(&addr(ROUTER)));
    assert!(vault.facts.collaterals.contains(&addr(0x22)));
    assert_eq!(vault.counters.gov_set_ltv, 1);
}

#[tokio::test]
async fn test_vault_is_attributed_through_its_router() {
    let mut harness = Harness::new(scenario(10_000), default_factories());
    let report = harness.orchestrator.run_once().await.unwrap();
    assert_eq!(report.entities.vaults_attributed, 1);

    let progress = harness.stored_progress();
    let expected: BTreeSet<String> = ["Chainlink", "Chronicle", "Pyth"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(vendors_for_vault(&progress, addr(VAULT)), expected);

    let vault = &progress.entities[&addr(VAULT)];
    assert_eq!(vault.facts.asset_vendors, expected);
    // The router behind the vault is not a registry price source
    assert!(!vault.facts.vendors.contains_key(&addr(ROUTER)));
}

#[tokio::test]
async fn test_cleared_pair_config_is_not_escrow() {
    let chain = scenario(10_000);
    chain.push(
        addr(ROUTER),
        3_500,
        0,
        EventPayload::ConfigSet {
            base: addr(0x44),
            quote: addr(USD),
            oracle: Address::zero(),
        },
    );
    let mut harness = Harness::new(chain, default_factories());
    harness.orchestrator.run_once().await.unwrap();

    let progress = harness.stored_progress();
    let router = &progress.entities[&addr(ROUTER)];
    assert_eq!(router.counters.config_set, 4);
    assert!(!router.facts.adapters.contains(&Address::zero()));
    assert!(!router.facts.vendors.contains_key(&Address::zero()));
}

#[tokio::test]
async fn test_rerun_at_same_head_is_byte_identical() {
    let mut harness = Harness::new(scenario(10_000), default_factories());
    harness.orchestrator.run_once().await.unwrap();
    let first = harness.stored_bytes();
    let queries_after_first = harness.chain.queries().len();

    let report = harness.orchestrator.run_once().await.unwrap();
    assert_eq!(harness.stored_bytes(), first);
    assert_eq!(report.entities.skipped, 2);
    assert!(report.sources.iter().all(|s| !s.queried));
    assert_eq!(harness.chain.queries().len(), queries_after_first);
}

#[tokio::test]
async fn test_rerun_with_failing_entity_is_byte_identical() {
    let chain = scenario(10_000);
    let vault = addr(VAULT);
    chain.fail_when(move |address, kind, _, _| {
        (address == vault && kind == EventKind::GovSetLtv).then(|| RpcError::Reverted("execution reverted".into()))
    });
    let mut harness = Harness::new(chain, default_factories());

    harness.orchestrator.run_once().await.unwrap();
    let first = harness.stored_bytes();
    let report = harness.orchestrator.run_once().await.unwrap();

    // The vault is still due and fails again, without changing what is stored
    assert_eq!(report.entities.failed.len(), 1);
    assert_eq!(harness.stored_bytes(), first);
}

#[tokio::test]
async fn test_recheck_is_additive_and_checkpoints_only_advance() {
    let mut harness = Harness::new(scenario(10_000), default_factories());
    harness.orchestrator.run_once().await.unwrap();
    let before = harness.stored_progress();

    // Inside the recheck interval: nothing is requeried
    harness.chain.set_head(10_100);
    let report = harness.orchestrator.run_once().await.unwrap();
    assert_eq!(report.entities.skipped, 2);

    // Pair reconfigured to a new adapter, past the recheck interval
    harness.chain.push(
        addr(ROUTER),
        65_000,
        0,
        EventPayload::ConfigSet {
            base: addr(ASSET),
            quote: addr(USD),
            oracle: addr(REDSTONE_ADAPTER),
        },
    );
    harness.chain.set_head(70_000);
    let report = harness.orchestrator.run_once().await.unwrap();
    assert_eq!(report.entities.processed, 2);

    let after = harness.stored_progress();
    assert!(after.checkpoint().is_monotonic_from(&before.checkpoint()));
    for (address, old) in &before.entities {
        let new = &after.entities[address];
        assert!(old.facts.is_subset_of(&new.facts), "facts shrank for {:?}", address);
        assert!(new.last_processed_block >= old.last_processed_block);
    }

    let router = &after.entities[&addr(ROUTER)];
    assert_eq!(router.last_processed_block, Some(70_000));
    assert_eq!(router.counters.config_set, 4);
    assert!(router.facts.adapters.contains(&addr(CHAINLINK_ADAPTER)));
    assert_eq!(
        router.facts.vendors[&addr(REDSTONE_ADAPTER)],
        VendorClassification::external("RedStone")
    );

    // Entity requery starts right after the previous checkpoint
    let router_queries = harness
        .chain
        .queries()
        .into_iter()
        .filter(|q| q.address == addr(ROUTER) && q.kind == EventKind::ConfigSet)
        .map(|q| (q.from, q.to))
        .collect_vec();
    assert_eq!(router_queries.last(), Some(&(60_001, 70_000)));
}

#[tokio::test]
async fn test_dropped_factory_range_is_retried_next_run() {
    let chain = scenario(10_000);
    let vault_factory = addr(VAULT_FACTORY);
    chain.fail_when(move |address, kind, from, to| {
        (address == vault_factory && kind == EventKind::ProxyCreated && from <= 1_300 && to >= 1_300)
            .then(|| RpcError::RateLimited("429 Too Many Requests".to_string()))
    });
    let mut harness = Harness::new(chain, default_factories());

    let report = harness.orchestrator.run_once().await.unwrap();
    assert!(!report.is_complete());
    assert!(report.unresolved_ranges > 0);
    let progress = harness.stored_progress();
    assert!(!progress.sources["vaults"].deployments.contains(&addr(VAULT)));
    assert!(progress.sources["vaults"]
        .unresolved_ranges
        .iter()
        .any(|r| r.from <= 1_300 && r.to >= 1_300));
    let vault_factory_queries = harness
        .chain
        .queries()
        .into_iter()
        .filter(|q| q.address == vault_factory)
        .count();
    assert!(vault_factory_queries > 1);

    harness.chain.heal();
    let report = harness.orchestrator.run_once().await.unwrap();
    assert!(report.is_complete());
    let progress = harness.stored_progress();
    assert!(progress.sources["vaults"].deployments.contains(&addr(VAULT)));
    assert!(progress.sources["vaults"].unresolved_ranges.is_empty());
    assert_eq!(
        progress.entities[&addr(VAULT)].last_processed_block,
        Some(10_000)
    );
}

#[tokio::test]
async fn test_permanent_source_error_keeps_checkpoint_and_run_continues() {
    let chain = scenario(10_000);
    let router_factory = addr(ROUTER_FACTORY);
    chain.fail_when(move |address, _, _, _| {
        (address == router_factory).then(|| RpcError::Decode {
            what: "ProxyCreated".to_string(),
            message: "unexpected topic count".to_string(),
        })
    });
    let mut harness = Harness::new(chain, default_factories());

    let report = harness.orchestrator.run_once().await.unwrap();
    assert_eq!(report.source_errors.len(), 1);
    assert_eq!(report.source_errors[0].name, "routers");
    assert!(!report.is_complete());

    let progress = harness.stored_progress();
    assert!(progress
        .sources
        .get("routers")
        .map_or(true, |s| s.last_synced_block.is_none()));
    assert_eq!(progress.sources["vaults"].last_synced_block, Some(10_000));
    assert_eq!(progress.entities[&addr(VAULT)].last_processed_block, Some(10_000));
}

#[tokio::test]
async fn test_entity_failure_is_recorded_not_raised() {
    let chain = scenario(10_000);
    let vault = addr(VAULT);
    chain.fail_when(move |address, kind, _, _| {
        (address == vault && kind == EventKind::GovSetLtv).then(|| RpcError::Reverted("execution reverted".into()))
    });
    let mut harness = Harness::new(chain, default_factories());

    let report = harness.orchestrator.run_once().await.unwrap();
    assert_eq!(report.entities.failed.len(), 1);
    assert_eq!(report.entities.failed[0].address, vault);
    assert_eq!(report.entities.processed, 1);

    let progress = harness.stored_progress();
    let record = &progress.entities[&vault];
    assert_eq!(record.last_processed_block, None);
    assert!(record.last_error.is_some());
    assert_eq!(record.facts, Default::default());
}

#[tokio::test]
async fn test_persistence_failure_aborts_run() {
    let mut harness = Harness::new(scenario(10_000), default_factories());
    harness.backend.set_fail_writes(true);

    let err = harness.orchestrator.run_once().await.unwrap_err();
    assert!(matches!(err, SyncError::Persistence(_)));
    assert!(err.is_fatal());
}
