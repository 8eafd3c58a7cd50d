//! Disposable CockroachDB instances for tests.
//!
//! [`provision`] yields a connection target plus a cleanup guard. When
//! `CR_URL` is set the shared instance it points at is used as-is (table
//! from `CR_TABLE`); otherwise a throwaway single-node container is started
//! with the docker CLI and removed when the guard is dropped.

use std::process::Command;
use std::time::{Duration, Instant};

use postgres::{Client, NoTls};
use tracing::{info, warn};

use crate::cockroach::DEFAULT_TABLE;
use crate::retry::RetryPolicy;

pub const ENV_URL: &str = "CR_URL";
pub const ENV_TABLE: &str = "CR_TABLE";
pub const IMAGE: &str = "cockroachdb/cockroach:latest-v23.1";

const SQL_PORT: &str = "26257/tcp";
const CONTAINER_TABLE: &str = "database.vault_kv";
const READY_TIMEOUT: Duration = Duration::from_secs(60);

/// A reachable cluster. Dropping it removes the container, if one was
/// started.
#[derive(Debug)]
pub struct Provisioned {
    pub url: String,
    pub table: String,
    container: Option<String>,
}

impl Drop for Provisioned {
    fn drop(&mut self) {
        if let Some(id) = self.container.take() {
            match docker(&["rm", "-f", &id]) {
                Ok(_) => info!("removed cockroachdb container {}", short(&id)),
                Err(e) => warn!("failed to remove container {}: {}", short(&id), e),
            }
        }
    }
}

/// Use an externally supplied cluster when the environment names one.
pub fn from_env_vars(url: Option<String>, table: Option<String>) -> Option<Provisioned> {
    let url = url.filter(|u| !u.is_empty())?;
    let table = table
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_TABLE.to_string());
    Some(Provisioned {
        url,
        table,
        container: None,
    })
}

/// Provision a cluster, or return None when neither `CR_URL` nor a working
/// docker daemon is available.
pub fn provision() -> Option<Provisioned> {
    if let Some(target) = from_env_vars(std::env::var(ENV_URL).ok(), std::env::var(ENV_TABLE).ok())
    {
        info!("using cockroachdb from {}", ENV_URL);
        return Some(target);
    }

    match start_container() {
        Ok(target) => Some(target),
        Err(e) => {
            warn!("cockroachdb unavailable, skipping: {}", e);
            None
        }
    }
}

fn start_container() -> Result<Provisioned, String> {
    let id = docker(&["run", "-d", "-P", IMAGE, "start-single-node", "--insecure"])?
        .trim()
        .to_string();
    // From here on the guard owns the container and cleans it up on error.
    let mut target = Provisioned {
        url: String::new(),
        table: CONTAINER_TABLE.to_string(),
        container: Some(id.clone()),
    };

    let output = docker(&["port", &id, SQL_PORT])?;
    let port = parse_port(&output).ok_or_else(|| format!("no port mapping in {:?}", output))?;
    target.url = format!("postgresql://root@localhost:{}/?sslmode=disable", port);
    info!("started cockroachdb container {} on port {}", short(&id), port);

    wait_ready(&target.url)?;
    Ok(target)
}

/// Retry with exponential backoff until the node accepts SQL, creating the
/// database the container table lives in.
fn wait_ready(url: &str) -> Result<(), String> {
    let policy = RetryPolicy {
        max_attempts: u32::MAX,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(2),
    };
    let started = Instant::now();
    let mut attempt = 0;
    loop {
        let result = Client::connect(url, NoTls)
            .and_then(|mut client| client.batch_execute("CREATE DATABASE IF NOT EXISTS database"));
        match result {
            Ok(()) => return Ok(()),
            Err(e) if started.elapsed() < READY_TIMEOUT => {
                std::thread::sleep(policy.backoff(attempt));
                attempt += 1;
                if attempt % 10 == 0 {
                    info!("waiting for cockroachdb: {}", e);
                }
            }
            Err(e) => return Err(format!("cockroachdb did not become ready: {}", e)),
        }
    }
}

fn docker(args: &[&str]) -> Result<String, String> {
    let output = Command::new("docker")
        .args(args)
        .output()
        .map_err(|e| format!("failed to execute docker: {}", e))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

/// Extract the host port from `docker port` output such as
/// `0.0.0.0:32768\n[::]:32768`.
fn parse_port(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit(':').next())
        .find_map(|port| port.parse().ok())
}

fn short(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_target_uses_default_table() {
        let target = from_env_vars(Some("postgresql://root@db:26257/".into()), None).unwrap();
        assert_eq!(target.url, "postgresql://root@db:26257/");
        assert_eq!(target.table, "vault_kv_store");
    }

    #[test]
    fn env_target_honors_table_override() {
        let target = from_env_vars(
            Some("postgresql://root@db:26257/".into()),
            Some("shared.kv".into()),
        )
        .unwrap();
        assert_eq!(target.table, "shared.kv");
    }

    #[test]
    fn empty_env_means_provision() {
        assert!(from_env_vars(None, Some("kv".into())).is_none());
        assert!(from_env_vars(Some(String::new()), None).is_none());
    }

    #[test]
    fn docker_port_output() {
        assert_eq!(parse_port("0.0.0.0:32768\n[::]:32768\n"), Some(32768));
        assert_eq!(parse_port("[::]:49153"), Some(49153));
        assert_eq!(parse_port(""), None);
        assert_eq!(parse_port("garbage"), None);
    }
}
