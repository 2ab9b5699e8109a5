//! Executor backed by the system `zpool(8)` binary.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::executor::{ExecResult, ExecutorError, PoolExecutor, PoolUsage};
use crate::types::{PoolHealth, PoolRecord, RaidType, Vdev, Zpool};

pub struct ZpoolCliExecutor {
    bin: PathBuf,
}

impl ZpoolCliExecutor {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run(&self, args: &[String]) -> ExecResult<String> {
        let command = format!("{} {}", self.bin.display(), args.join(" "));
        debug!(command = %command, "running zpool");
        let output = Command::new(&self.bin)
            .args(args)
            .output()
            .await
            .map_err(|e| ExecutorError::Spawn {
                program: self.bin.display().to_string(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(ExecutorError::CommandFailed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn local_properties(&self, name: &str) -> ExecResult<HashMap<String, String>> {
        let out = self
            .run(&args(&["get", "-H", "-o", "property,value,source", "all", name]))
            .await?;
        Ok(parse_local_properties(&out))
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Builds the argument list for `zpool create`.
pub fn create_args(spec: &Zpool) -> Vec<String> {
    let mut out = vec!["create".to_string()];
    if spec.create_force {
        out.push("-f".to_string());
    }
    let mut props: Vec<_> = spec.properties.iter().collect();
    props.sort();
    for (k, v) in props {
        out.push("-o".to_string());
        out.push(format!("{}={}", k, v));
    }
    out.push(spec.name.clone());
    for vdev in &spec.vdevs {
        if let Some(kw) = spec.raid_type.zpool_keyword() {
            out.push(kw.to_string());
        }
        out.extend(vdev.devices.iter().cloned());
    }
    if !spec.spares.is_empty() {
        out.push("spare".to_string());
        out.extend(spec.spares.iter().cloned());
    }
    out
}

#[derive(PartialEq)]
enum Section {
    Pool,
    Spares,
    Other,
}

/// Parses the `config:` block of `zpool status -P <pool>`.
pub fn parse_status(name: &str, text: &str) -> ExecResult<PoolRecord> {
    let mut record = PoolRecord {
        name: name.to_string(),
        raid_type: RaidType::Stripe,
        vdevs: Vec::new(),
        spares: Vec::new(),
        properties: HashMap::new(),
        health: PoolHealth::Unknown,
    };
    let mut in_config = false;
    let mut seen_pool = false;
    let mut section = Section::Other;
    let mut current: Option<usize> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("config:") {
            in_config = true;
            continue;
        }
        if !in_config {
            if let Some(state) = trimmed.strip_prefix("state:") {
                record.health = PoolHealth::parse(state.trim());
            }
            continue;
        }
        if trimmed.starts_with("errors:") {
            break;
        }
        if trimmed.is_empty() {
            continue;
        }
        let body = line.trim_start_matches('\t');
        let indent = body.len() - body.trim_start_matches(' ').len();
        let mut fields = trimmed.split_whitespace();
        let label = fields.next().unwrap_or_default();
        let state = fields.next().unwrap_or_default();

        match indent {
            0 => {
                current = None;
                section = if label == name {
                    seen_pool = true;
                    record.health = PoolHealth::parse(state);
                    Section::Pool
                } else if label == "spares" {
                    Section::Spares
                } else {
                    Section::Other
                };
            }
            2 => match section {
                Section::Pool => {
                    if let Some(kind) = RaidType::from_vdev_label(label) {
                        record.raid_type = kind;
                        record.vdevs.push(Vdev {
                            name: label.to_string(),
                            devices: Vec::new(),
                        });
                        current = Some(record.vdevs.len() - 1);
                    } else if label.starts_with("replacing-") || label.starts_with("spare-") {
                        record.vdevs.push(Vdev {
                            name: label.to_string(),
                            devices: Vec::new(),
                        });
                        current = Some(record.vdevs.len() - 1);
                    } else {
                        record.vdevs.push(Vdev {
                            name: label.to_string(),
                            devices: vec![label.to_string()],
                        });
                        current = None;
                    }
                }
                Section::Spares => record.spares.push(label.to_string()),
                Section::Other => {}
            },
            _ => {
                if section != Section::Pool
                    || label.starts_with("replacing-")
                    || label.starts_with("spare-")
                {
                    continue;
                }
                if let Some(idx) = current {
                    record.vdevs[idx].devices.push(label.to_string());
                }
            }
        }
    }

    if !seen_pool {
        return Err(ExecutorError::Parse {
            command: format!("zpool status -P {}", name),
            reason: "pool line missing from config block".to_string(),
        });
    }
    Ok(record)
}

/// Parses `zpool list -Hp -o allocated,free,size,dedupratio <pool>`.
pub fn parse_usage(text: &str) -> ExecResult<PoolUsage> {
    let parse_err = |reason: String| ExecutorError::Parse {
        command: "zpool list -Hp".to_string(),
        reason,
    };
    let line = text
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| parse_err("empty output".to_string()))?;
    let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
    if fields.len() < 4 {
        return Err(parse_err(format!("expected 4 fields, got {}", fields.len())));
    }
    let num = |s: &str| {
        s.parse::<u64>()
            .map_err(|e| parse_err(format!("{:?}: {}", s, e)))
    };
    let dedup = fields[3].trim_end_matches('x');
    Ok(PoolUsage {
        allocated: num(fields[0])?,
        free: num(fields[1])?,
        size: num(fields[2])?,
        dedup_ratio: dedup
            .parse::<f64>()
            .map_err(|e| parse_err(format!("{:?}: {}", fields[3], e)))?,
    })
}

/// Keeps only properties whose source is `local`.
pub fn parse_local_properties(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let mut cols = line.split('\t');
            let property = cols.next()?;
            let value = cols.next()?;
            let source = cols.next()?;
            (source.trim() == "local").then(|| (property.to_string(), value.to_string()))
        })
        .collect()
}

fn is_missing_pool(err: &ExecutorError) -> bool {
    matches!(err, ExecutorError::CommandFailed { stderr, .. } if stderr.contains("no such pool"))
}

#[async_trait]
impl PoolExecutor for ZpoolCliExecutor {
    async fn create_pool(&self, spec: &Zpool) -> ExecResult<()> {
        info!(pool = %spec.name, force = spec.create_force, "zpool create");
        self.run(&create_args(spec)).await.map(|_| ())
    }

    async fn destroy_pool(&self, name: &str, force: bool) -> ExecResult<()> {
        let mut a = args(&["destroy"]);
        if force {
            a.push("-f".to_string());
        }
        a.push(name.to_string());
        self.run(&a).await.map(|_| ())
    }

    async fn import_pool(&self, name: &str, force: bool) -> ExecResult<()> {
        let mut a = args(&["import"]);
        if force {
            a.push("-f".to_string());
        }
        a.push(name.to_string());
        self.run(&a).await.map(|_| ())
    }

    async fn export_pool(&self, name: &str) -> ExecResult<()> {
        self.run(&args(&["export", name])).await.map(|_| ())
    }

    async fn set_properties(
        &self,
        name: &str,
        properties: &HashMap<String, String>,
    ) -> ExecResult<()> {
        let mut props: Vec<_> = properties.iter().collect();
        props.sort();
        // zpool set takes a single property per invocation.
        for (k, v) in props {
            self.run(&args(&["set", &format!("{}={}", k, v), name])).await?;
        }
        Ok(())
    }

    async fn add_spares(&self, name: &str, devices: &[String]) -> ExecResult<()> {
        let mut a = args(&["add", name, "spare"]);
        a.extend(devices.iter().cloned());
        self.run(&a).await.map(|_| ())
    }

    async fn remove_vdev(&self, name: &str, vdev: &str) -> ExecResult<()> {
        self.run(&args(&["remove", name, vdev])).await.map(|_| ())
    }

    async fn replace_device(&self, name: &str, old: &str, new: &str) -> ExecResult<()> {
        self.run(&args(&["replace", name, old, new])).await.map(|_| ())
    }

    async fn pool_status(&self, name: &str) -> ExecResult<Option<PoolRecord>> {
        let text = match self.run(&args(&["status", "-P", name])).await {
            Ok(text) => text,
            Err(err) if is_missing_pool(&err) => return Ok(None),
            Err(err) => return Err(err),
        };
        let mut record = parse_status(name, &text)?;
        record.properties = self.local_properties(name).await?;
        Ok(Some(record))
    }

    async fn list_pools(&self) -> ExecResult<Vec<PoolRecord>> {
        let names = self.run(&args(&["list", "-H", "-o", "name"])).await?;
        let mut pools = Vec::new();
        for name in names.lines().map(str::trim).filter(|n| !n.is_empty()) {
            if let Some(record) = self.pool_status(name).await? {
                pools.push(record);
            }
        }
        Ok(pools)
    }

    async fn query_stats(&self, name: &str) -> ExecResult<PoolUsage> {
        let out = self
            .run(&args(&["list", "-Hp", "-o", "allocated,free,size,dedupratio", name]))
            .await?;
        parse_usage(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIRROR_STATUS: &str = "  pool: tank
 state: ONLINE
config:

\tNAME          STATE     READ WRITE CKSUM
\ttank          ONLINE       0     0     0
\t  mirror-0    ONLINE       0     0     0
\t    /dev/da0  ONLINE       0     0     0
\t    /dev/da1  ONLINE       0     0     0
\t  mirror-1    ONLINE       0     0     0
\t    /dev/da2  ONLINE       0     0     0
\t    /dev/da3  ONLINE       0     0     0
\tspares
\t  /dev/da4    AVAIL

errors: No known data errors
";

    const REPLACING_STATUS: &str = "  pool: tank
 state: DEGRADED
config:

\tNAME             STATE     READ WRITE CKSUM
\ttank             DEGRADED     0     0     0
\t  raidz1-0       DEGRADED     0     0     0
\t    /dev/da0     ONLINE       0     0     0
\t    replacing-1  DEGRADED     0     0     0
\t      /dev/da1   FAULTED      0     0     0
\t      /dev/da5   ONLINE       0     0     0
\t    /dev/da2     ONLINE       0     0     0

errors: No known data errors
";

    #[test]
    fn test_parse_mirror_status() {
        let record = parse_status("tank", MIRROR_STATUS).unwrap();
        assert_eq!(record.raid_type, RaidType::Mirror);
        assert_eq!(record.health, PoolHealth::Online);
        assert_eq!(record.vdevs.len(), 2);
        assert_eq!(record.vdevs[0].name, "mirror-0");
        assert_eq!(record.vdevs[1].devices, vec!["/dev/da2", "/dev/da3"]);
        assert_eq!(record.spares, vec!["/dev/da4"]);
    }

    #[test]
    fn test_parse_replacing_status_lists_both_devices() {
        let record = parse_status("tank", REPLACING_STATUS).unwrap();
        assert_eq!(record.raid_type, RaidType::Raidz);
        assert_eq!(record.health, PoolHealth::Degraded);
        assert_eq!(
            record.vdevs[0].devices,
            vec!["/dev/da0", "/dev/da1", "/dev/da5", "/dev/da2"]
        );
    }

    #[test]
    fn test_parse_stripe_status() {
        let text = "config:\n\n\tNAME        STATE\n\tscratch     ONLINE\n\t  /dev/da7  ONLINE\n\t  /dev/da8  ONLINE\n";
        let record = parse_status("scratch", text).unwrap();
        assert_eq!(record.raid_type, RaidType::Stripe);
        assert_eq!(record.vdevs.len(), 2);
        assert_eq!(record.vdevs[1].devices, vec!["/dev/da8"]);
    }

    #[test]
    fn test_parse_status_without_pool_line() {
        assert!(parse_status("tank", "config:\n\n\tNAME STATE\n").is_err());
    }

    #[test]
    fn test_parse_usage() {
        let usage = parse_usage("1024\t3072\t4096\t1.25x\n").unwrap();
        assert_eq!(usage.allocated, 1024);
        assert_eq!(usage.free, 3072);
        assert_eq!(usage.size, 4096);
        assert!((usage.dedup_ratio - 1.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_usage_rejects_garbage() {
        assert!(parse_usage("").is_err());
        assert!(parse_usage("a\tb\tc\td").is_err());
        assert!(parse_usage("1\t2").is_err());
    }

    #[test]
    fn test_parse_local_properties() {
        let text = "autoexpand\ton\tlocal\nsize\t4096\t-\ncomment\tbackup\tlocal\n";
        let props = parse_local_properties(text);
        assert_eq!(props.len(), 2);
        assert_eq!(props.get("autoexpand").map(String::as_str), Some("on"));
    }

    #[test]
    fn test_create_args_raidz_with_spares_and_force() {
        let mut spec = Zpool {
            name: "tank".into(),
            raid_type: RaidType::Raidz,
            vdevs: vec![Vdev::new("", &["/dev/da0", "/dev/da1"]), Vdev::new("", &["/dev/da2", "/dev/da3"])],
            spares: vec!["/dev/da9".into()],
            create_force: true,
            ..Default::default()
        };
        spec.properties.insert("ashift".into(), "12".into());
        assert_eq!(
            create_args(&spec).join(" "),
            "create -f -o ashift=12 tank raidz /dev/da0 /dev/da1 raidz /dev/da2 /dev/da3 spare /dev/da9"
        );
    }

    #[test]
    fn test_create_args_stripe_has_no_keyword() {
        let spec = Zpool {
            name: "scratch".into(),
            vdevs: vec![Vdev::new("", &["/dev/da7"])],
            ..Default::default()
        };
        assert_eq!(create_args(&spec).join(" "), "create scratch /dev/da7");
    }
}
