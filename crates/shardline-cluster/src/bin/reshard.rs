// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shardline Reshard
//!
//! Lays a fleet out across the hosts of one bot application and writes the
//! cluster assignments to the cluster store.
//!
//! Usage:
//!   shardline-reshard --shards <n> --clusters <n> --client-id <id> [--env <name>] [--dry-run]

use std::collections::BTreeSet;
use std::process::ExitCode;

use shardline_cluster::model::HostRef;
use shardline_cluster::partition::provision_clusters;
use shardline_cluster::store::{ClusterStore, PostgresClusterStore};
use tracing::info;

fn print_usage() {
    eprintln!(
        r#"Usage: shardline-reshard [options]

Provision clusters across the hosts of a client and store the assignment.
Existing clusters of those hosts' states are replaced.

OPTIONS:
    --shards <n>            Fleet shard count (default: $SHARD_COUNT_OVERRIDE)
    --clusters <n>          Cluster count (default: $CLUSTER_COUNT)
    --client-id <id>        Bot application id (default: $CLIENT_ID)
    --env <name>            Environment label (default: dev)
    --dry-run               Print the layout without writing it

ENVIRONMENT:
    DATABASE_URL            Cluster store connection string (required)
"#
    );
}

#[derive(Debug, PartialEq, Eq)]
struct Args {
    shards: u32,
    clusters: u32,
    client_id: String,
    env: String,
    dry_run: bool,
}

fn parse_number(value: Option<String>, name: &str) -> Result<u32, String> {
    value
        .ok_or_else(|| format!("{} is required", name))?
        .parse()
        .map_err(|_| format!("Invalid {}", name))
}

fn parse_args_from_vec(
    args: &[String],
    env: impl Fn(&str) -> Option<String>,
) -> Result<Args, String> {
    let mut shards = env("SHARD_COUNT_OVERRIDE");
    let mut clusters = env("CLUSTER_COUNT");
    let mut client_id = env("CLIENT_ID");
    let mut label = "dev".to_string();
    let mut dry_run = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "help" | "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--shards" => {
                i += 1;
                shards = Some(args.get(i).ok_or("--shards requires a number")?.clone());
            }
            "--clusters" => {
                i += 1;
                clusters = Some(args.get(i).ok_or("--clusters requires a number")?.clone());
            }
            "--client-id" => {
                i += 1;
                client_id = Some(args.get(i).ok_or("--client-id requires an ID")?.clone());
            }
            "--env" => {
                i += 1;
                label = args.get(i).ok_or("--env requires a name")?.clone();
            }
            "--dry-run" => dry_run = true,
            arg => return Err(format!("Unknown argument: {}", arg)),
        }
        i += 1;
    }

    Ok(Args {
        shards: parse_number(shards, "--shards")?,
        clusters: parse_number(clusters, "--clusters")?,
        client_id: client_id.ok_or("--client-id is required")?,
        env: label,
        dry_run,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shardline_reshard=info,shardline_cluster=info".into()),
        )
        .init();

    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args_from_vec(&argv, |name| std::env::var(name).ok()) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match reshard(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn reshard(args: Args) -> Result<(), String> {
    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| "DATABASE_URL is required".to_string())?;
    let store = PostgresClusterStore::connect(&database_url)
        .await
        .map_err(|e| e.to_string())?;

    let hosts: Vec<HostRef> = store
        .find_hosts(&args.client_id)
        .await
        .map_err(|e| e.to_string())?
        .iter()
        .map(|host| host.host_ref())
        .collect();

    let clusters = provision_clusters(
        args.shards,
        args.clusters,
        &hosts,
        Some(&args.client_id),
        &args.env,
    )
    .map_err(|e| e.to_string())?;

    for spec in &clusters {
        let host = spec.host.as_ref().map(|host| host.name.as_str()).unwrap_or("-");
        println!("cluster {:>4}  shards {:<12} host {}", spec.id, spec.shards.to_string(), host);
    }

    if args.dry_run {
        info!(clusters = clusters.len(), "Dry run, nothing written");
        return Ok(());
    }

    let states: Vec<i32> = hosts
        .iter()
        .map(|host| host.state)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let removed = store
        .delete_clusters(&states)
        .await
        .map_err(|e| e.to_string())?;
    store
        .insert_clusters(&clusters)
        .await
        .map_err(|e| e.to_string())?;

    info!(
        removed,
        inserted = clusters.len(),
        hosts = hosts.len(),
        "Cluster assignments replaced"
    );
    Ok(())
}
