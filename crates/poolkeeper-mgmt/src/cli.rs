use crate::config::AdminConfig;
use crate::token_store::{mint, token_hash};
use crate::types::{PoolRecord, Zpool};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pk-mgmt")]
#[command(about = "poolkeeper storage pool administration", long_about = None)]
pub struct Cli {
    #[arg(short, long, default_value = "http://localhost:8420")]
    pub server: String,

    #[arg(short, long, env = "PK_ADMIN_TOKEN")]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    Pool {
        #[command(subcommand)]
        cmd: PoolCmd,
    },
    Audit {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    Token {
        #[command(subcommand)]
        cmd: TokenCmd,
    },
    Serve {
        #[arg(short, long, default_value = "/etc/poolkeeper/mgmt.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand, Clone)]
pub enum PoolCmd {
    List,
    Show {
        name: String,
    },
    /// Create a pool from a JSON spec file.
    Create {
        file: PathBuf,
    },
    Destroy {
        name: String,
        #[arg(long)]
        force: bool,
    },
    Import {
        name: String,
        #[arg(long)]
        force: bool,
    },
    Export {
        name: String,
    },
    /// Set pool properties given as KEY=VALUE pairs.
    SetProps {
        name: String,
        #[arg(required = true, value_parser = parse_property)]
        properties: Vec<(String, String)>,
    },
    AddSpares {
        name: String,
        #[arg(required = true)]
        devices: Vec<String>,
    },
    /// Remove a top-level vdev (`mirror-1`) or a single-device vdev by path.
    RemoveVdev {
        name: String,
        vdev: String,
    },
    Replace {
        name: String,
        old: String,
        new: String,
    },
    Stats {
        name: String,
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand, Clone)]
pub enum TokenCmd {
    /// Sign a token with the configured secret and print it with its hash.
    Mint {
        #[arg(short, long, default_value = "/etc/poolkeeper/mgmt.toml")]
        config: PathBuf,
        principal: String,
        #[arg(long, default_value = "86400")]
        ttl: i64,
    },
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
}

#[derive(Deserialize)]
struct SuccessBody<T> {
    data: T,
}

impl Cli {
    /// Runs a client subcommand. `serve` is handled by the binary.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Pool { ref cmd } => self.pool(cmd).await,
            Command::Audit { limit } => self.audit(limit).await,
            Command::Token { ref cmd } => Self::token(cmd),
            Command::Serve { .. } => anyhow::bail!("serve is handled by the pk-mgmt binary"),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let client = Client::new();
        let url = format!("{}{}", self.server.trim_end_matches('/'), path);

        let mut request = client.request(method, &url);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            match response.json::<ErrorBody>().await {
                Ok(err) => anyhow::bail!("{} ({}): {}", status, err.error, err.message),
                Err(_) => anyhow::bail!("Request failed: {}", status),
            }
        }
        let body: SuccessBody<T> = response.json().await?;
        Ok(body.data)
    }

    async fn pool(&self, cmd: &PoolCmd) -> Result<()> {
        match cmd {
            PoolCmd::List => {
                let pools: Vec<PoolRecord> = self.call(Method::GET, "/api/zfs/pools", None).await?;
                println!("{:<24} {:<8} {:<10} {:>6} {:>6}", "NAME", "TYPE", "HEALTH", "VDEVS", "SPARES");
                for pool in pools {
                    println!(
                        "{:<24} {:<8} {:<10} {:>6} {:>6}",
                        pool.name,
                        pool.raid_type.to_string(),
                        format!("{:?}", pool.health).to_lowercase(),
                        pool.vdevs.len(),
                        pool.spares.len()
                    );
                }
            }
            PoolCmd::Show { name } => {
                let pool: serde_json::Value = self
                    .call(Method::GET, &pool_path(name, ""), None)
                    .await?;
                println!("{}", serde_json::to_string_pretty(&pool)?);
            }
            PoolCmd::Create { file } => {
                let contents = std::fs::read_to_string(file)
                    .with_context(|| format!("reading {}", file.display()))?;
                let spec: Zpool = serde_json::from_str(&contents)?;
                let pool: PoolRecord = self
                    .call(Method::POST, "/api/zfs/pools", Some(serde_json::to_value(&spec)?))
                    .await?;
                println!("Created pool {} ({} vdevs)", pool.name, pool.vdevs.len());
            }
            PoolCmd::Destroy { name, force } => {
                let path = format!("{}?force={}", pool_path(name, ""), force);
                let _: serde_json::Value = self.call(Method::DELETE, &path, None).await?;
                println!("Destroyed pool {}", name);
            }
            PoolCmd::Import { name, force } => {
                let body = serde_json::json!({ "force": force });
                let _: serde_json::Value = self
                    .call(Method::POST, &pool_path(name, "/import"), Some(body))
                    .await?;
                println!("Imported pool {}", name);
            }
            PoolCmd::Export { name } => {
                let _: serde_json::Value = self
                    .call(Method::POST, &pool_path(name, "/export"), None)
                    .await?;
                println!("Exported pool {}", name);
            }
            PoolCmd::SetProps { name, properties } => {
                let body: HashMap<&str, &str> = properties
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                let pool: PoolRecord = self
                    .call(
                        Method::PATCH,
                        &pool_path(name, "/properties"),
                        Some(serde_json::to_value(&body)?),
                    )
                    .await?;
                println!("Set {} properties on {}", body.len(), pool.name);
            }
            PoolCmd::AddSpares { name, devices } => {
                let body = serde_json::json!({ "devices": devices });
                let pool: PoolRecord = self
                    .call(Method::POST, &pool_path(name, "/spares"), Some(body))
                    .await?;
                println!("{} now has {} spares", pool.name, pool.spares.len());
            }
            PoolCmd::RemoveVdev { name, vdev } => {
                let suffix = format!("/vdevs/{}", urlencoding::encode(vdev));
                let _: PoolRecord = self
                    .call(Method::DELETE, &pool_path(name, &suffix), None)
                    .await?;
                println!("Removed {} from {}", vdev, name);
            }
            PoolCmd::Replace { name, old, new } => {
                let body = serde_json::json!({ "old": old, "new": new });
                let _: serde_json::Value = self
                    .call(Method::POST, &pool_path(name, "/replace-device"), Some(body))
                    .await?;
                println!("Replacing {} with {} in {}; resilver started", old, new, name);
            }
            PoolCmd::Stats { name, limit } => {
                let mut path = pool_path(name, "/stats");
                if let Some(limit) = limit {
                    path.push_str(&format!("?limit={}", limit));
                }
                let points: Vec<crate::types::PoolStatPoint> =
                    self.call(Method::GET, &path, None).await?;
                println!("{:<12} {:>16} {:>16} {:>16} {:>6}", "TIME", "ALLOC", "FREE", "SIZE", "DEDUP");
                for p in points {
                    println!(
                        "{:<12} {:>16} {:>16} {:>16} {:>6.2}",
                        p.time, p.allocated, p.free, p.size, p.dedup_ratio
                    );
                }
            }
        }
        Ok(())
    }

    async fn audit(&self, limit: usize) -> Result<()> {
        let path = format!("/api/info/audit-records?limit={}", limit);
        let records: Vec<crate::audit_trail::AuditRecord> =
            self.call(Method::GET, &path, None).await?;
        for r in records {
            let outcome = match r.outcome {
                crate::audit_trail::AuditOutcome::Success => "ok".to_string(),
                crate::audit_trail::AuditOutcome::Failure { code, .. } => code,
            };
            println!(
                "{:>6} {} {:<12} {:<20} {:<32} {}",
                r.id,
                r.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
                r.actor,
                format!("{:?}", r.action),
                r.target,
                outcome
            );
        }
        Ok(())
    }

    fn token(cmd: &TokenCmd) -> Result<()> {
        match cmd {
            TokenCmd::Mint {
                config,
                principal,
                ttl,
            } => {
                let config = AdminConfig::load_or_default(config)?;
                if config.token_secret.is_empty() {
                    anyhow::bail!("token_secret is not set in the config");
                }
                let token = mint(config.token_secret.as_bytes(), principal, *ttl)?;
                println!("token: {}", token);
                println!("hash:  {}", token_hash(&token));
            }
        }
        Ok(())
    }
}

fn parse_property(pair: &str) -> Result<(String, String), String> {
    match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", pair)),
    }
}

fn pool_path(name: &str, suffix: &str) -> String {
    format!("/api/zfs/pools/{}{}", urlencoding::encode(name), suffix)
}
