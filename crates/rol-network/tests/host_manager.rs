//! Integration tests for HostNetworkManager.

mod common;

use common::{Fixture, net};
use rol_common::{ErrorKind, RolError, VlanId};
use rol_network::{
    HostOp, Link, LinkInventory, LinkKind, MemoryHost, NetworkEvent, NetworkMutator,
    OperationPhase, Table, TrafficRule,
};

fn id(v: u16) -> VlanId {
    VlanId::new(v).unwrap()
}

#[test_log::test(tokio::test)]
async fn test_created_names_follow_convention() {
    let fx = Fixture::new().await;

    let vlan = fx.network.create_vlan("enp0s3", id(10), &[]).await.unwrap();
    assert_eq!(vlan.name, "enp0s3.10");
    assert_eq!(vlan.parent, "enp0s3");
    assert_eq!(vlan.vlan_id, 10);

    let bridge = fx.network.create_bridge("lab1", &[], &[]).await.unwrap();
    assert_eq!(bridge.name, "rol.lab1");

    let nested = fx.network.create_vlan("rol.lab1", id(100), &[]).await.unwrap();
    assert_eq!(nested.name, "rol.lab1.100");
}

#[test_log::test(tokio::test)]
async fn test_create_vlan_assigns_addresses_and_sets_up() {
    let fx = Fixture::new().await;

    let vlan = fx
        .network
        .create_vlan("enp0s3", id(20), &[net("10.0.20.1/24"), net("fd00:20::1/64")])
        .await
        .unwrap();

    assert!(vlan.is_up);
    assert_eq!(vlan.addresses, vec![net("10.0.20.1/24"), net("fd00:20::1/64")]);
    assert_eq!(fx.store.resets(), 0);
}

#[test_log::test(tokio::test)]
async fn test_missing_parent_makes_no_mutation() {
    let fx = Fixture::new().await;

    let err = fx
        .network
        .create_vlan("eth7", id(10), &[net("10.0.0.1/24")])
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(fx.host.mutation_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_duplicate_create_is_rejected_before_mutation() {
    let fx = Fixture::new().await;
    fx.network.create_vlan("enp0s3", id(10), &[]).await.unwrap();
    fx.network.create_bridge("lab1", &[], &[]).await.unwrap();
    fx.host.clear_journal();

    let err = fx.network.create_vlan("enp0s3", id(10), &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    let err = fx.network.create_bridge("rol.lab1", &[], &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    assert_eq!(fx.host.mutation_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_address_failure_resets_once_and_returns_original_error() {
    let fx = Fixture::new().await;
    fx.host.fail_once(HostOp::AddrAdd);

    let err = fx
        .network
        .create_vlan("enp0s3", id(30), &[net("10.0.30.1/24")])
        .await
        .unwrap_err();

    assert_eq!(fx.store.resets(), 1);
    assert!(!err.is_fatal());
    assert_eq!(err.kind(), ErrorKind::IoFailure);
    assert!(matches!(
        err.root(),
        RolError::IoFailure { message, .. } if message == "injected failure"
    ));
    // The VLAN did not exist at the last save.
    assert!(fx.host.find_by_name("enp0s3.30").await.unwrap().is_none());
}

#[test_log::test(tokio::test)]
async fn test_failed_reset_escalates_to_fatal() {
    let fx = Fixture::new().await;
    let mut events = fx.network.events().subscribe();
    fx.host.fail_on(HostOp::AddrAdd);
    fx.host.fail_on(HostOp::DeleteLink);

    let err = fx
        .network
        .create_vlan("enp0s3", id(40), &[net("10.0.40.1/24")])
        .await
        .unwrap_err();

    assert!(err.is_fatal());
    let RolError::Fatal { original, .. } = &err else {
        panic!("expected fatal error, got {err:?}");
    };
    assert_eq!(original.kind(), ErrorKind::IoFailure);

    let mut saw_divergence = false;
    let mut last_phase = None;
    while let Ok(event) = events.try_recv() {
        match event {
            NetworkEvent::FatalDivergence { link, .. } => {
                assert_eq!(link, "enp0s3.40");
                saw_divergence = true;
            }
            NetworkEvent::Transition { to, .. } => last_phase = Some(to),
            _ => {}
        }
    }
    assert!(saw_divergence);
    assert_eq!(last_phase, Some(OperationPhase::ResetFailed));
}

#[test_log::test(tokio::test)]
async fn test_successful_create_publishes_phases() {
    let fx = Fixture::new().await;
    let mut events = fx.network.events().subscribe();

    fx.network
        .create_vlan("enp0s3", id(50), &[net("10.0.50.1/24")])
        .await
        .unwrap();

    let mut phases = Vec::new();
    while let Ok(NetworkEvent::Transition { to, .. }) = events.try_recv() {
        phases.push(to);
    }
    assert_eq!(
        phases,
        vec![
            OperationPhase::Created,
            OperationPhase::Addressed,
            OperationPhase::Reconciled
        ]
    );
}

#[test_log::test(tokio::test)]
async fn test_unmanaged_names_are_not_found() {
    let mut docker = Link::new(0, "docker0", LinkKind::Bridge);
    docker.is_up = true;
    let host = MemoryHost::new()
        .with_physical("enp0s3")
        .with_physical("enp0s8")
        .with_link(docker);
    let fx = Fixture::with_host(host).await;
    fx.host.create_vlan("enp0s3", id(60)).await.unwrap();
    fx.host.clear_journal();

    let checks = [
        fx.network.update_vlan("enp0s3.60", &[]).await.unwrap_err(),
        fx.network.delete_vlan("enp0s3.60").await.unwrap_err(),
        fx.network.update_vlan("enp0s3", &[]).await.unwrap_err(),
        fx.network.delete_bridge("docker0").await.unwrap_err(),
        fx.network
            .update_bridge("docker0", &["enp0s8".to_string()], &[])
            .await
            .unwrap_err(),
        fx.network.get_bridge("docker0").await.unwrap_err(),
        fx.network.delete_vlan("rol.missing").await.unwrap_err(),
    ];
    for err in checks {
        assert!(err.is_not_found(), "expected NotFound, got {err:?}");
    }
    assert_eq!(fx.host.mutation_count(), 0);
    assert!(fx.host.find_by_name("docker0").await.unwrap().is_some());
}

#[test_log::test(tokio::test)]
async fn test_update_vlan_syncs_addresses() {
    let fx = Fixture::new().await;
    fx.network.create_bridge("lab1", &[], &[]).await.unwrap();
    fx.network
        .create_vlan("rol.lab1", id(100), &[net("10.1.0.1/24"), net("10.1.1.1/24")])
        .await
        .unwrap();
    fx.host.clear_journal();

    let vlan = fx
        .network
        .update_vlan("rol.lab1.100", &[net("10.1.1.1/24"), net("10.1.2.1/24")])
        .await
        .unwrap();

    assert_eq!(vlan.addresses, vec![net("10.1.1.1/24"), net("10.1.2.1/24")]);
    assert_eq!(fx.host.count(HostOp::AddrDelete), 1);
    assert_eq!(fx.host.count(HostOp::AddrAdd), 1);

    let listed = fx.network.list_vlans().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "rol.lab1.100");
}

#[test_log::test(tokio::test)]
async fn test_delete_vlan_detaches_first() {
    let fx = Fixture::new().await;
    fx.network.create_bridge("lab1", &[], &[]).await.unwrap();
    fx.network.create_bridge("lab2", &[], &[]).await.unwrap();
    fx.network.create_vlan("rol.lab1", id(5), &[]).await.unwrap();
    fx.host.set_link_master("rol.lab1.5", "rol.lab2").await.unwrap();
    fx.host.clear_journal();

    fx.network.delete_vlan("rol.lab1.5").await.unwrap();

    let ops: Vec<HostOp> = fx.host.journal().iter().map(|c| c.op()).collect();
    assert_eq!(ops, vec![HostOp::UnsetLinkMaster, HostOp::DeleteLink]);
    assert!(fx.network.get_vlan("rol.lab1.5").await.unwrap_err().is_not_found());
}

#[test_log::test(tokio::test)]
async fn test_bridge_slaves_are_reconciled() {
    let host = MemoryHost::new()
        .with_physical("enp0s3")
        .with_physical("enp0s8")
        .with_physical("enp0s9");
    let fx = Fixture::with_host(host).await;

    let bridge = fx
        .network
        .create_bridge("lab1", &["enp0s8".to_string()], &[net("10.10.10.1/24")])
        .await
        .unwrap();
    assert_eq!(bridge.slaves, vec!["enp0s8".to_string()]);
    assert!(bridge.is_up);

    let bridge = fx
        .network
        .update_bridge("rol.lab1", &["enp0s9".to_string()], &[])
        .await
        .unwrap();
    assert_eq!(bridge.slaves, vec!["enp0s9".to_string()]);
    assert!(bridge.addresses.is_empty());
    assert!(fx.host.get_by_name("enp0s8").await.unwrap().master_name.is_none());

    fx.network.delete_bridge("rol.lab1").await.unwrap();
    assert!(fx.host.get_by_name("enp0s9").await.unwrap().master_name.is_none());
    assert!(fx.network.list_bridges().await.unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_bridge_slave_validation() {
    let fx = Fixture::new().await;

    let err = fx
        .network
        .create_bridge("lab1", &["eth9".to_string()], &[])
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = fx
        .network
        .create_bridge("lab1", &["rol.lab1".to_string()], &[])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(fx.host.mutation_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_failed_bridge_delete_is_compensated() {
    let fx = Fixture::new().await;
    fx.network
        .create_bridge("lab1", &["enp0s8".to_string()], &[])
        .await
        .unwrap();
    fx.network.save_configuration().await.unwrap();
    fx.host.fail_once(HostOp::DeleteLink);

    let err = fx.network.delete_bridge("rol.lab1").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::IoFailure);
    assert_eq!(fx.store.resets(), 1);
    let bridge = fx.network.get_bridge("rol.lab1").await.unwrap();
    assert_eq!(bridge.slaves, vec!["enp0s8".to_string()]);
}

#[test_log::test(tokio::test)]
async fn test_failure_before_mutation_skips_reset() {
    let fx = Fixture::new().await;
    fx.host.fail_once(HostOp::CreateVlan);

    let err = fx.network.create_vlan("enp0s3", id(70), &[]).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::IoFailure);
    assert_eq!(fx.store.resets(), 0);
}

#[test_log::test(tokio::test)]
async fn test_traffic_rules() {
    let fx = Fixture::new().await;
    let rule = TrafficRule::parse("FORWARD", "ACCEPT", "10.10.10.0/24", "").unwrap();

    fx.network
        .create_traffic_rule(Table::Filter, rule.clone())
        .await
        .unwrap();
    let err = fx
        .network
        .create_traffic_rule(Table::Filter, rule.clone())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    assert_eq!(
        fx.network.list_chain_rules(Table::Filter, "FORWARD").await.unwrap(),
        vec![rule.clone()]
    );
    assert!(fx.network.list_table_rules(Table::Nat).await.unwrap().is_empty());

    fx.network.delete_traffic_rule(Table::Filter, &rule).await.unwrap();
    let err = fx
        .network
        .delete_traffic_rule(Table::Filter, &rule)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test_log::test(tokio::test)]
async fn test_rule_identity_ignores_host_bits() {
    let fx = Fixture::new().await;
    let mut with_host_bits = TrafficRule::new("FORWARD", "ACCEPT");
    with_host_bits.source = Some(net("10.10.10.1/24"));
    let canonical = TrafficRule::new("FORWARD", "ACCEPT").from(net("10.10.10.0/24"));

    let created = fx
        .network
        .create_traffic_rule(Table::Filter, with_host_bits.clone())
        .await
        .unwrap();
    assert_eq!(created, canonical);

    let err = fx
        .network
        .create_traffic_rule(Table::Filter, canonical)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    fx.network
        .delete_traffic_rule(Table::Filter, &with_host_bits)
        .await
        .unwrap();
    assert!(fx.network.list_table_rules(Table::Filter).await.unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_concurrent_creates_are_serialised() {
    let fx = Fixture::new().await;

    let (a, b) = tokio::join!(
        fx.network.create_bridge("lab1", &[], &[]),
        fx.network.create_bridge("lab1", &[], &[]),
    );

    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.into_iter().find_map(Result::err).unwrap();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(fx.host.count(HostOp::CreateBridge), 1);
}

#[test_log::test(tokio::test)]
async fn test_unsaved_changes_round_trip() {
    let fx = Fixture::new().await;
    assert!(!fx.network.has_unsaved_changes().await.unwrap());

    fx.network.create_bridge("lab1", &[], &[]).await.unwrap();
    assert!(fx.network.has_unsaved_changes().await.unwrap());

    fx.network.reset_changes().await.unwrap();
    assert!(!fx.network.has_unsaved_changes().await.unwrap());
    assert!(fx.host.find_by_name("rol.lab1").await.unwrap().is_none());
}
