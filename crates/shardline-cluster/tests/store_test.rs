// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL cluster store tests. Require `TEST_DATABASE_URL`.

mod common;

use shardline_cluster::error::Error;
use shardline_cluster::model::{ClusterSpec, HostRef, ShardRange};
use shardline_cluster::partition::provision_clusters;
use shardline_cluster::store::{ClusterStore, HostRecord, PostgresClusterStore};
use uuid::Uuid;

/// Store plus a state and client id no other test uses.
async fn isolated_store() -> (PostgresClusterStore, i32, String) {
    let url = std::env::var("TEST_DATABASE_URL").unwrap();
    let store = PostgresClusterStore::connect(&url).await.unwrap();
    let state = 10_000 + (Uuid::new_v4().as_u128() % 1_000_000) as i32;
    (store, state, Uuid::new_v4().to_string())
}

fn host(name: &str, state: i32, client_id: &str, position: i32) -> HostRecord {
    HostRecord {
        name: name.to_string(),
        hostname: format!("{}.internal", name),
        state,
        client_id: Some(client_id.to_string()),
        position,
    }
}

#[tokio::test]
async fn test_hosts_in_fleet_order() {
    skip_if_no_db!();
    let (store, state, client) = isolated_store().await;
    let second = host(&format!("b-{}", client), state, &client, 1);
    let first = host(&format!("a-{}", client), state, &client, 0);

    store.upsert_host(&second).await.unwrap();
    store.upsert_host(&first).await.unwrap();
    assert_eq!(store.find_hosts(&client).await.unwrap(), vec![first.clone(), second]);

    let moved = HostRecord {
        hostname: "elsewhere.internal".to_string(),
        ..first.clone()
    };
    store.upsert_host(&moved).await.unwrap();
    assert_eq!(store.find_host(&first.name).await.unwrap(), Some(moved));
    assert_eq!(store.find_host("no-such-host").await.unwrap(), None);
}

#[tokio::test]
async fn test_cluster_lifecycle() {
    skip_if_no_db!();
    let (store, state, client) = isolated_store().await;
    let hosts = vec![HostRef {
        name: format!("h-{}", client),
        hostname: "h.internal".to_string(),
        state,
    }];

    let clusters = provision_clusters(8, 4, &hosts, Some(&client), "test").unwrap();
    store.insert_clusters(&clusters).await.unwrap();

    let found = store.find_clusters(state).await.unwrap();
    assert_eq!(found, clusters);
    assert_eq!(store.find_cluster(state, 2).await.unwrap(), Some(clusters[2].clone()));
    assert_eq!(store.find_cluster(state, 9).await.unwrap(), None);

    let target = HostRef {
        name: format!("t-{}", client),
        hostname: "t.internal".to_string(),
        state,
    };
    assert!(store.update_cluster_host(state, 1, &target).await.unwrap());
    assert!(!store.update_cluster_host(state, 9, &target).await.unwrap());
    let moved = store.find_cluster(state, 1).await.unwrap().unwrap();
    assert_eq!(moved.host, Some(target));

    assert_eq!(store.delete_clusters(&[state]).await.unwrap(), 4);
    assert!(store.find_clusters(state).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_insert_rejects_cluster_without_host() {
    skip_if_no_db!();
    let (store, state, _client) = isolated_store().await;
    let cluster = ClusterSpec::new(0, ShardRange::new(0, 1, 2).unwrap(), 1);

    assert!(matches!(
        store.insert_clusters(&[cluster]).await,
        Err(Error::InvalidRecord(_))
    ));
    assert!(store.find_clusters(state).await.unwrap().is_empty());
}
