// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL cluster store.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::migrate::{MigrateError, Migrator};

use super::{ClusterStore, HostRecord, cluster_state};
use crate::error::{Error, Result};
use crate::model::{ClusterSpec, HostRef, ShardRange};

/// Schema migrations embedded at compile time.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply pending migrations.
pub async fn migrate(pool: &PgPool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[derive(Debug, sqlx::FromRow)]
struct ClusterRow {
    state: i32,
    id: i32,
    first_shard_id: i32,
    last_shard_id: i32,
    shard_count: i32,
    cluster_count: i32,
    host_name: String,
    hostname: String,
    client_id: Option<String>,
    env: String,
}

fn to_u32(field: &str, value: i32) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::InvalidRecord(format!("negative {}: {}", field, value)))
}

fn to_i32(field: &str, value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| Error::InvalidRecord(format!("{} out of range: {}", field, value)))
}

impl TryFrom<ClusterRow> for ClusterSpec {
    type Error = Error;

    fn try_from(row: ClusterRow) -> Result<Self> {
        let shards = ShardRange::new(
            to_u32("first_shard_id", row.first_shard_id)?,
            to_u32("last_shard_id", row.last_shard_id)?,
            to_u32("shard_count", row.shard_count)?,
        )?;
        Ok(ClusterSpec {
            id: to_u32("id", row.id)?,
            shards,
            cluster_count: to_u32("cluster_count", row.cluster_count)?,
            host: Some(HostRef {
                name: row.host_name,
                hostname: row.hostname,
                state: row.state,
            }),
            client_id: row.client_id,
            env: row.env,
        })
    }
}

const CLUSTER_COLUMNS: &str = "state, id, first_shard_id, last_shard_id, shard_count, \
     cluster_count, host_name, hostname, client_id, env";

/// Clusters of `state`, ordered by id.
pub async fn find_clusters(pool: &PgPool, state: i32) -> Result<Vec<ClusterSpec>> {
    let rows = sqlx::query_as::<_, ClusterRow>(&format!(
        "SELECT {} FROM clusters WHERE state = $1 ORDER BY id",
        CLUSTER_COLUMNS
    ))
    .bind(state)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(ClusterSpec::try_from).collect()
}

/// One cluster of `state`.
pub async fn find_cluster(pool: &PgPool, state: i32, id: u32) -> Result<Option<ClusterSpec>> {
    let row = sqlx::query_as::<_, ClusterRow>(&format!(
        "SELECT {} FROM clusters WHERE state = $1 AND id = $2",
        CLUSTER_COLUMNS
    ))
    .bind(state)
    .bind(to_i32("id", id)?)
    .fetch_optional(pool)
    .await?;

    row.map(ClusterSpec::try_from).transpose()
}

/// Insert clusters in one transaction.
pub async fn insert_clusters(pool: &PgPool, clusters: &[ClusterSpec]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for spec in clusters {
        let state = cluster_state(spec)?;
        let (host_name, hostname) = spec
            .host
            .as_ref()
            .map(|host| (host.name.as_str(), host.hostname.as_str()))
            .unwrap_or_default();

        sqlx::query(
            r#"
            INSERT INTO clusters (state, id, first_shard_id, last_shard_id, shard_count,
                                  cluster_count, host_name, hostname, client_id, env)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(state)
        .bind(to_i32("id", spec.id)?)
        .bind(to_i32("first_shard_id", spec.shards.first_shard_id())?)
        .bind(to_i32("last_shard_id", spec.shards.last_shard_id())?)
        .bind(to_i32("shard_count", spec.shards.shard_count())?)
        .bind(to_i32("cluster_count", spec.cluster_count)?)
        .bind(host_name)
        .bind(hostname)
        .bind(spec.client_id.as_deref())
        .bind(&spec.env)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Reassign one cluster.
pub async fn update_cluster_host(pool: &PgPool, state: i32, id: u32, host: &HostRef) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE clusters
        SET state = $3, host_name = $4, hostname = $5
        WHERE state = $1 AND id = $2
        "#,
    )
    .bind(state)
    .bind(to_i32("id", id)?)
    .bind(host.state)
    .bind(&host.name)
    .bind(&host.hostname)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Delete every cluster of `states`.
pub async fn delete_clusters(pool: &PgPool, states: &[i32]) -> Result<u64> {
    let result = sqlx::query("DELETE FROM clusters WHERE state = ANY($1)")
        .bind(states)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Host by name.
pub async fn find_host(pool: &PgPool, name: &str) -> Result<Option<HostRecord>> {
    let host = sqlx::query_as::<_, HostRecord>(
        "SELECT name, hostname, state, client_id, position FROM hosts WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(host)
}

/// Hosts of a client in fleet order.
pub async fn find_hosts(pool: &PgPool, client_id: &str) -> Result<Vec<HostRecord>> {
    let hosts = sqlx::query_as::<_, HostRecord>(
        r#"
        SELECT name, hostname, state, client_id, position
        FROM hosts
        WHERE client_id = $1
        ORDER BY position, name
        "#,
    )
    .bind(client_id)
    .fetch_all(pool)
    .await?;

    Ok(hosts)
}

/// Insert or update a host.
pub async fn upsert_host(pool: &PgPool, host: &HostRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO hosts (name, hostname, state, client_id, position)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (name) DO UPDATE
        SET hostname = EXCLUDED.hostname,
            state = EXCLUDED.state,
            client_id = EXCLUDED.client_id,
            position = EXCLUDED.position
        "#,
    )
    .bind(&host.name)
    .bind(&host.hostname)
    .bind(host.state)
    .bind(host.client_id.as_deref())
    .bind(host.position)
    .execute(pool)
    .await?;

    Ok(())
}

/// Cluster store backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresClusterStore {
    pool: PgPool,
}

impl PostgresClusterStore {
    /// Store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and apply migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        migrate(&pool).await?;
        Ok(Self::new(pool))
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ClusterStore for PostgresClusterStore {
    async fn find_clusters(&self, state: i32) -> Result<Vec<ClusterSpec>> {
        find_clusters(&self.pool, state).await
    }

    async fn find_cluster(&self, state: i32, id: u32) -> Result<Option<ClusterSpec>> {
        find_cluster(&self.pool, state, id).await
    }

    async fn insert_clusters(&self, clusters: &[ClusterSpec]) -> Result<()> {
        insert_clusters(&self.pool, clusters).await
    }

    async fn update_cluster_host(&self, state: i32, id: u32, host: &HostRef) -> Result<bool> {
        update_cluster_host(&self.pool, state, id, host).await
    }

    async fn delete_clusters(&self, states: &[i32]) -> Result<u64> {
        delete_clusters(&self.pool, states).await
    }

    async fn find_host(&self, name: &str) -> Result<Option<HostRecord>> {
        find_host(&self.pool, name).await
    }

    async fn find_hosts(&self, client_id: &str) -> Result<Vec<HostRecord>> {
        find_hosts(&self.pool, client_id).await
    }

    async fn upsert_host(&self, host: &HostRecord) -> Result<()> {
        upsert_host(&self.pool, host).await
    }
}
