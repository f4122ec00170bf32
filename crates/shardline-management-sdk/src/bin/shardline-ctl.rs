// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shardline Control CLI
//!
//! CLI tool for operating a shardline fleet.
//!
//! Usage:
//!   shardline-ctl <command> [options]
//!
//! Commands:
//!   ping                          Check the control server
//!   shards                        Shard status of every cluster
//!   ping-workers                  Ping every worker
//!   restart <id|all>              Restart through the control server
//!   guild-update <json>           Broadcast a guild update
//!   stats <json>                  Broadcast stats
//!   reload <module>               Reload a module
//!   manager-restart <id|all>      Restart through the cluster manager
//!   move-cluster <id> <host>      Move a cluster to another host
//!   create-cluster <id>           Start a cluster on this host
//!   processes                     List the host's processes
//!   restart-process <uuid>        Restart one process
//!   restart-manager               Restart the cluster manager

use std::process::ExitCode;

use serde_json::Value;
use shardline_management_sdk::{ManagementSdk, RestartTarget, SdkConfig};

fn print_usage() {
    eprintln!(
        r#"Usage: shardline-ctl <command> [options]

Operate a shardline fleet.

CONTROL SERVER COMMANDS:
    ping                            Check the control server
    shards                          Shard status of every cluster
    ping-workers                    Ping every worker
    restart <id|all>                Restart one cluster or all of them
    guild-update <json>             Broadcast a guild update
    stats <json>                    Broadcast stats
    reload <module>                 Reload a module (e.g. logger)

CLUSTER MANAGER COMMANDS:
    manager-restart <id|all>        Restart one cluster or all of them
    move-cluster <id> <host>        Move a cluster to another host
    create-cluster <id>             Start a cluster on this host

PROCESS MANAGER COMMANDS:
    processes                       List the host's processes
    restart-process <uuid>          Restart one process
    restart-manager                 Restart the cluster manager

ENVIRONMENT:
    SHARDLINE_CONTROL_URL           Control server (default: http://127.0.0.1:5000)
    RPC_HOST                        Manager host (default: localhost)
    MANAGER_RPC_PORT                Cluster manager port (default: 5052)
    PROCESS_MANAGER_PORT            Process manager port (default: 5050)
    RESTART_TOKEN                   Token for control-server restarts
    RPC_TOKEN                       Token for cluster manager restarts and moves

EXAMPLES:
    # Restart cluster 3
    RESTART_TOKEN=secret shardline-ctl restart 3

    # Move cluster 7 to host titan
    RPC_TOKEN=secret RPC_HOST=atlas shardline-ctl move-cluster 7 titan
"#
    );
}

#[derive(Debug, PartialEq)]
enum Command {
    Ping,
    Shards,
    PingWorkers,
    Restart(RestartTarget),
    GuildUpdate(Value),
    Stats(Value),
    Reload(String),
    ManagerRestart(RestartTarget),
    MoveCluster { id: u32, host: String },
    CreateCluster(u32),
    Processes,
    RestartProcess(String),
    RestartManager,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();
    parse_args_from_vec(&args)
}

fn positional<'a>(args: &'a [String], index: usize, what: &str) -> Result<&'a str, String> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| format!("{} is required", what))
}

fn cluster_id(value: &str) -> Result<u32, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid cluster id: {}", value))
}

fn json_arg(value: &str) -> Result<Value, String> {
    serde_json::from_str(value).map_err(|e| format!("Invalid JSON: {}", e))
}

fn parse_args_from_vec(args: &[String]) -> Result<Command, String> {
    let Some(command) = args.get(1) else {
        return Err("No command specified".to_string());
    };

    let cmd = match command.as_str() {
        "help" | "--help" | "-h" => {
            print_usage();
            std::process::exit(0);
        }
        "ping" => Command::Ping,
        "shards" => Command::Shards,
        "ping-workers" => Command::PingWorkers,
        "restart" => Command::Restart(positional(args, 2, "Cluster id")?.parse()?),
        "guild-update" => Command::GuildUpdate(json_arg(positional(args, 2, "Payload")?)?),
        "stats" => Command::Stats(json_arg(positional(args, 2, "Payload")?)?),
        "reload" => Command::Reload(positional(args, 2, "Module")?.to_string()),
        "manager-restart" => {
            Command::ManagerRestart(positional(args, 2, "Cluster id")?.parse()?)
        }
        "move-cluster" => Command::MoveCluster {
            id: cluster_id(positional(args, 2, "Cluster id")?)?,
            host: positional(args, 3, "Host")?.to_string(),
        },
        "create-cluster" => Command::CreateCluster(cluster_id(positional(args, 2, "Cluster id")?)?),
        "processes" => Command::Processes,
        "restart-process" => Command::RestartProcess(positional(args, 2, "Process id")?.to_string()),
        "restart-manager" => Command::RestartManager,
        other => return Err(format!("Unknown command: {}", other)),
    };

    Ok(cmd)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cmd = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    let config = match SdkConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let sdk = match ManagementSdk::new(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to create SDK: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match execute_command(&sdk, cmd).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<(), String> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).map_err(|e| e.to_string())?
    );
    Ok(())
}

async fn execute_command(sdk: &ManagementSdk, cmd: Command) -> Result<(), String> {
    match cmd {
        Command::Ping => {
            println!("{}", sdk.ping().await.map_err(|e| e.to_string())?);
        }

        Command::Shards => {
            print_json(&sdk.shards().await.map_err(|e| e.to_string())?)?;
        }

        Command::PingWorkers => {
            let answers = sdk.ping_workers().await.map_err(|e| e.to_string())?;
            let silent = answers.iter().filter(|a| !a.is_ok()).count();
            print_json(&answers)?;
            if silent > 0 {
                return Err(format!("{} worker(s) did not answer", silent));
            }
        }

        Command::Restart(target) => {
            sdk.restart(target).await.map_err(|e| e.to_string())?;
            println!("OK");
        }

        Command::GuildUpdate(payload) => {
            sdk.guild_update(payload).await.map_err(|e| e.to_string())?;
            println!("OK");
        }

        Command::Stats(payload) => {
            sdk.post_stats(payload).await.map_err(|e| e.to_string())?;
            println!("OK");
        }

        Command::Reload(module) => {
            sdk.reload(&module).await.map_err(|e| e.to_string())?;
            println!("OK");
        }

        Command::ManagerRestart(target) => {
            let result = sdk
                .manager_restart(target)
                .await
                .map_err(|e| e.to_string())?;
            print_json(&result)?;
        }

        Command::MoveCluster { id, host } => {
            sdk.move_cluster(id, &host)
                .await
                .map_err(|e| e.to_string())?;
            println!("Cluster {} moved to {}", id, host);
        }

        Command::CreateCluster(id) => {
            let process = sdk.create_cluster(id).await.map_err(|e| e.to_string())?;
            print_json(&process)?;
        }

        Command::Processes => {
            let processes = sdk.list_processes().await.map_err(|e| e.to_string())?;
            if processes.is_empty() {
                println!("No processes");
            }
            for process in processes {
                let cluster = process
                    .cluster_id()
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let pid = process
                    .pid
                    .map(|pid| pid.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  cluster {:>4}  pid {:>7}  since {}",
                    process.id,
                    cluster,
                    pid,
                    process.created_at.to_rfc3339()
                );
            }
        }

        Command::RestartProcess(id) => {
            let process = sdk.restart_process(&id).await.map_err(|e| e.to_string())?;
            print_json(&process)?;
        }

        Command::RestartManager => {
            sdk.restart_manager().await.map_err(|e| e.to_string())?;
            println!("OK");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(a: &[&str]) -> Vec<String> {
        a.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_control_commands() {
        assert_eq!(parse_args_from_vec(&args(&["ctl", "ping"])), Ok(Command::Ping));
        assert_eq!(
            parse_args_from_vec(&args(&["ctl", "restart", "all"])),
            Ok(Command::Restart(RestartTarget::All))
        );
        assert_eq!(
            parse_args_from_vec(&args(&["ctl", "restart", "4"])),
            Ok(Command::Restart(RestartTarget::Cluster(4)))
        );
        assert_eq!(
            parse_args_from_vec(&args(&["ctl", "guild-update", r#"{"guilds":3}"#])),
            Ok(Command::GuildUpdate(json!({"guilds": 3})))
        );
        assert_eq!(
            parse_args_from_vec(&args(&["ctl", "reload", "logger"])),
            Ok(Command::Reload("logger".to_string()))
        );
    }

    #[test]
    fn test_parse_manager_commands() {
        assert_eq!(
            parse_args_from_vec(&args(&["ctl", "move-cluster", "7", "titan"])),
            Ok(Command::MoveCluster {
                id: 7,
                host: "titan".to_string()
            })
        );
        assert_eq!(
            parse_args_from_vec(&args(&["ctl", "create-cluster", "2"])),
            Ok(Command::CreateCluster(2))
        );
        assert_eq!(
            parse_args_from_vec(&args(&["ctl", "restart-manager"])),
            Ok(Command::RestartManager)
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse_args_from_vec(&args(&["ctl"])),
            Err("No command specified".to_string())
        );
        assert_eq!(
            parse_args_from_vec(&args(&["ctl", "restart"])),
            Err("Cluster id is required".to_string())
        );
        assert_eq!(
            parse_args_from_vec(&args(&["ctl", "move-cluster", "x", "titan"])),
            Err("Invalid cluster id: x".to_string())
        );
        assert_eq!(
            parse_args_from_vec(&args(&["ctl", "move-cluster", "1"])),
            Err("Host is required".to_string())
        );
        assert!(
            parse_args_from_vec(&args(&["ctl", "stats", "{"]))
                .unwrap_err()
                .starts_with("Invalid JSON")
        );
        assert_eq!(
            parse_args_from_vec(&args(&["ctl", "explode"])),
            Err("Unknown command: explode".to_string())
        );
    }
}
