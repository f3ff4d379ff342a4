//! Integration tests for the registry, session and distributor working together
//!
//! Agents are driven through mock connections: status reports go in through
//! `update_status`, pushed configs are read back from the connection.

use fleet_control::{
    AgentId, AgentRegistry, Assignment, ConfigDistributor, DistributorConfig, PushOutcome,
    Unconfirmed,
};
use fleet_proto::{
    AgentConfigMap, AgentDescription, AgentToServer, ConfigValue, EffectiveConfig, KeyValue,
    RemoteConfigStatus, RemoteConfigStatuses,
};
use fleet_transport::test_support::MockConnection;
use fleet_transport::AgentConnection;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn register(registry: &AgentRegistry) -> (AgentId, Arc<MockConnection>) {
    let connection = MockConnection::new();
    let id = AgentId::new();
    registry.create_or_attach(id, connection.handle()).unwrap();
    (id, connection)
}

/// A full report echoing `document` as the running config
fn report_running(sequence_num: u64, document: &ConfigValue, hash: Vec<u8>) -> AgentToServer {
    AgentToServer {
        instance_uid: "collector-0".to_string(),
        sequence_num,
        agent_description: Some(AgentDescription {
            identifying_attributes: vec![KeyValue::new("service.name", "collector")],
            non_identifying_attributes: vec![],
        }),
        effective_config: Some(EffectiveConfig {
            config_map: AgentConfigMap::from_document(document).unwrap(),
        }),
        remote_config_status: Some(RemoteConfigStatus {
            last_remote_config_hash: hash,
            status: RemoteConfigStatuses::Applied,
            error_message: String::new(),
        }),
        ..Default::default()
    }
}

#[test]
fn scenario_assign_tenant_after_registration() {
    let registry = AgentRegistry::new();
    let (x, connection) = register(&registry);
    assert!(registry.find(x).unwrap().assignment.tenant_id.is_empty());

    registry
        .set_assignment(connection.connection_id(), &Assignment::new("t1", "", ""))
        .unwrap();

    let t1 = registry.snapshot_by_tenant("t1");
    assert_eq!(t1.len(), 1);
    assert_eq!(t1[0].id, x);
    assert!(registry.snapshot_by_tenant("t2").is_empty());
    assert_eq!(registry.assignment_counts(), (1, 0, 0));
}

#[tokio::test]
async fn scenario_get_config_before_first_report_is_not_configured() {
    let registry = AgentRegistry::new();
    let (id, connection) = register(&registry);
    let distributor = ConfigDistributor::new(
        registry.clone(),
        DistributorConfig::default().with_section("sampling"),
    );

    let outcome = distributor
        .update_config(id, &ConfigValue::from(json!({"policy": "always"})), false, None)
        .await
        .unwrap();
    assert_eq!(outcome, PushOutcome::Sent);

    // Pushed, but the agent has not reported anything yet
    assert_eq!(distributor.get_config(id).unwrap(), None);

    let pushed = connection
        .last_sent()
        .and_then(|message| message.remote_config)
        .unwrap();
    assert_eq!(
        pushed.config.primary_document().unwrap().unwrap(),
        ConfigValue::from(json!({"sampling": {"policy": "always"}}))
    );
}

#[tokio::test]
async fn scenario_status_report_releases_waiting_push() {
    let registry = AgentRegistry::new();
    let (y, connection) = register(&registry);
    let distributor = ConfigDistributor::new(registry.clone(), DistributorConfig::default());

    let change = ConfigValue::from(json!({"policies": [{"name": "errors", "type": "status_code"}]}));
    let waiter = {
        let distributor = distributor.clone();
        let change = change.clone();
        tokio::spawn(async move {
            distributor
                .update_config(y, &change, true, Some(Duration::from_secs(5)))
                .await
        })
    };

    // Wait for the push to reach the connection
    let pushed = loop {
        if let Some(remote) = connection.last_sent().and_then(|m| m.remote_config) {
            break remote;
        }
        tokio::task::yield_now().await;
    };

    let started = Instant::now();
    let document = pushed.config.primary_document().unwrap().unwrap();
    let reply = registry
        .update_status(
            connection.connection_id(),
            report_running(1, &document, pushed.config_hash.clone()),
        )
        .unwrap();

    let outcome = waiter.await.unwrap().unwrap();
    assert_eq!(outcome, PushOutcome::Confirmed);
    assert!(started.elapsed() < Duration::from_secs(5));

    // The agent reported the pushed hash, so nothing is re-offered
    assert!(reply.remote_config.is_none());
    assert_eq!(
        registry.find(y).unwrap().effective_config,
        Some(document.clone())
    );

    let section = distributor.get_config(y).unwrap().unwrap();
    assert_eq!(section, change);
}

#[test]
fn scenario_double_remove_is_noop() {
    let registry = AgentRegistry::new();
    let (id, connection) = register(&registry);
    let (other, _other_connection) = register(&registry);
    registry
        .reassign(id, &Assignment::new("t1", "g1", "d1"))
        .unwrap();
    registry
        .reassign(other, &Assignment::new("t1", "g1", "d1"))
        .unwrap();

    let removed = registry.remove(connection.connection_id()).unwrap();
    assert_eq!(removed.id, id);
    assert!(registry.remove(connection.connection_id()).is_none());

    assert_eq!(registry.count(), 1);
    assert!(registry.find(id).is_none());
    assert!(registry.find_by_connection(connection.connection_id()).is_none());
    let group: Vec<AgentId> = registry
        .snapshot_by_group("g1")
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(group, vec![other]);
    assert_eq!(registry.assignment_counts(), (1, 1, 1));
}

#[test]
fn scenario_group_reassignment_moves_agent() {
    let registry = AgentRegistry::new();
    let (id, _connection) = register(&registry);

    registry.reassign(id, &Assignment::group("g1")).unwrap();
    assert_eq!(registry.snapshot_by_group("g1").len(), 1);

    registry.reassign(id, &Assignment::group("g2")).unwrap();
    assert!(registry.snapshot_by_group("g1").is_empty());
    assert_eq!(registry.snapshot_by_group("g2")[0].id, id);
    // Empty buckets are dropped, not kept around
    assert_eq!(registry.assignment_counts(), (0, 1, 0));
}

#[tokio::test]
async fn test_disconnect_releases_waiting_push() {
    let registry = AgentRegistry::new();
    let (id, connection) = register(&registry);
    let distributor = ConfigDistributor::new(registry.clone(), DistributorConfig::default());

    let waiter = {
        let distributor = distributor.clone();
        tokio::spawn(async move {
            distributor
                .update_config(id, &ConfigValue::from(json!({"decision_wait": "10s"})), true, None)
                .await
        })
    };

    while connection.last_sent().is_none() {
        tokio::task::yield_now().await;
    }
    registry.remove(connection.connection_id());

    let outcome = waiter.await.unwrap().unwrap();
    assert_eq!(outcome, PushOutcome::Unconfirmed(Unconfirmed::Disconnected));
}

#[tokio::test]
async fn test_newer_push_supersedes_waiting_push() {
    let registry = AgentRegistry::new();
    let (id, connection) = register(&registry);
    let distributor = ConfigDistributor::new(registry.clone(), DistributorConfig::default());

    let first = {
        let distributor = distributor.clone();
        tokio::spawn(async move {
            distributor
                .update_config(id, &ConfigValue::from(json!({"num_traces": 100})), true, None)
                .await
        })
    };
    while connection.last_sent().is_none() {
        tokio::task::yield_now().await;
    }

    let second = distributor
        .update_config(id, &ConfigValue::from(json!({"num_traces": 200})), false, None)
        .await
        .unwrap();
    assert_eq!(second, PushOutcome::Sent);

    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome, PushOutcome::Unconfirmed(Unconfirmed::Superseded));
    assert_eq!(connection.sent().len(), 2);
}

#[tokio::test]
async fn test_changes_merge_into_reported_config() {
    let registry = AgentRegistry::new();
    let (id, connection) = register(&registry);
    let distributor = ConfigDistributor::new(registry.clone(), DistributorConfig::default());

    let running = ConfigValue::from(json!({
        "receivers": {"otlp": {"protocols": {"grpc": null}}},
        "processors": {"tail_sampling": {"decision_wait": "10s", "num_traces": 100}}
    }));
    registry
        .update_status(connection.connection_id(), report_running(0, &running, vec![]))
        .unwrap();

    distributor
        .update_config(id, &ConfigValue::from(json!({"num_traces": 500})), false, None)
        .await
        .unwrap();

    let pushed = connection
        .last_sent()
        .and_then(|m| m.remote_config)
        .and_then(|remote| remote.config.primary_document().unwrap())
        .unwrap();
    assert_eq!(
        pushed.section(&["processors", "tail_sampling"]),
        Some(&ConfigValue::from(json!({"decision_wait": "10s", "num_traces": 500})))
    );
    assert!(pushed.get("receivers").is_some());
}
