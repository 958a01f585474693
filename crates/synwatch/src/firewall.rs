//! Firewall control adapters.
//!
//! The block manager only needs two operations: insert a drop rule for a
//! source address and remove it again. [`IptablesFirewall`] shells out to
//! `iptables`; [`DryRunFirewall`] records the calls instead and is used for
//! `--dry-run` and in tests.

use std::net::IpAddr;
use std::process::Output;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::FirewallConfig;
use crate::error::{FirewallAction, WatchError, WatchResult};

/// Interface to the host firewall.
#[allow(async_fn_in_trait)]
pub trait FirewallControl: Send + Sync + 'static {
    /// Prepare the firewall (create chains, hooks). Called once at startup.
    fn prepare(&self) -> impl std::future::Future<Output = WatchResult<()>> + Send;

    /// Drop all traffic from `ip`.
    fn insert_drop_rule(&self, ip: IpAddr) -> impl std::future::Future<Output = WatchResult<()>> + Send;

    /// Remove the drop rule for `ip`.
    fn remove_drop_rule(&self, ip: IpAddr) -> impl std::future::Future<Output = WatchResult<()>> + Send;
}

/// `iptables`-backed firewall using a dedicated drop chain.
#[derive(Debug, Clone)]
pub struct IptablesFirewall {
    program: String,
    chain: String,
}

impl IptablesFirewall {
    /// Create from configuration.
    #[must_use]
    pub fn from_config(config: &FirewallConfig) -> Self {
        Self {
            program: config.program.clone(),
            chain: config.chain.clone(),
        }
    }

    /// Arguments matching the drop rule for `ip` (without the operation flag).
    fn rule_args(&self, ip: IpAddr) -> Vec<String> {
        vec![
            self.chain.clone(),
            "-s".to_string(),
            ip.to_string(),
            "-j".to_string(),
            "DROP".to_string(),
        ]
    }

    async fn run(&self, op: &str, rest: &[String]) -> std::io::Result<Output> {
        debug!(program = %self.program, op, args = ?rest, "running firewall command");
        Command::new(&self.program).arg(op).args(rest).output().await
    }

    /// A program that cannot be started is a configuration problem, not a
    /// transient failure.
    fn spawn_error(&self, ip: IpAddr, action: FirewallAction, e: &std::io::Error) -> WatchError {
        match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                WatchError::Config(format!("cannot run {}: {e}", self.program))
            }
            _ => Self::command_error(ip, action, e.to_string()),
        }
    }

    fn command_error(ip: IpAddr, action: FirewallAction, reason: impl Into<String>) -> WatchError {
        WatchError::FirewallCommand {
            ip,
            action,
            reason: reason.into(),
        }
    }
}

impl FirewallControl for IptablesFirewall {
    async fn prepare(&self) -> WatchResult<()> {
        let created = self.run("-N", std::slice::from_ref(&self.chain)).await?;
        let stderr = String::from_utf8_lossy(&created.stderr);
        if !created.status.success() && !stderr.contains("Chain already exists") {
            return Err(WatchError::Internal(format!(
                "failed to create chain {}: {}",
                self.chain,
                stderr.trim()
            )));
        }

        let hook = vec!["INPUT".to_string(), "-j".to_string(), self.chain.clone()];
        let present = self.run("-C", &hook).await?;
        if !present.status.success() {
            let inserted = self.run("-I", &hook).await?;
            if !inserted.status.success() {
                warn!(
                    chain = %self.chain,
                    error = %String::from_utf8_lossy(&inserted.stderr).trim(),
                    "failed to hook drop chain into INPUT"
                );
            }
        }

        info!(chain = %self.chain, "drop chain ready");
        Ok(())
    }

    async fn insert_drop_rule(&self, ip: IpAddr) -> WatchResult<()> {
        let rule = self.rule_args(ip);

        // Already present: a block re-issued after restart must not stack rules.
        let check = self
            .run("-C", &rule)
            .await
            .map_err(|e| self.spawn_error(ip, FirewallAction::Insert, &e))?;
        if check.status.success() {
            debug!(ip = %ip, chain = %self.chain, "drop rule already present");
            return Ok(());
        }

        let mut insert = rule;
        insert.insert(1, "1".to_string());
        let output = self
            .run("-I", &insert)
            .await
            .map_err(|e| self.spawn_error(ip, FirewallAction::Insert, &e))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Self::command_error(
                ip,
                FirewallAction::Insert,
                format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ))
        }
    }

    async fn remove_drop_rule(&self, ip: IpAddr) -> WatchResult<()> {
        let output = self
            .run("-D", &self.rule_args(ip))
            .await
            .map_err(|e| self.spawn_error(ip, FirewallAction::Remove, &e))?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("does a matching rule exist") {
            debug!(ip = %ip, "drop rule already gone");
            return Ok(());
        }
        Err(Self::command_error(
            ip,
            FirewallAction::Remove,
            format!("{}: {}", output.status, stderr.trim()),
        ))
    }
}

/// One call recorded by [`DryRunFirewall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FirewallCall {
    /// Operation requested.
    pub action: FirewallAction,
    /// Target address.
    pub ip: IpAddr,
}

#[derive(Debug)]
struct InjectedFailure {
    action: FirewallAction,
    remaining: u32,
    retryable: bool,
}

#[derive(Debug, Default)]
struct DryRunState {
    calls: Vec<FirewallCall>,
    failures: Vec<InjectedFailure>,
}

/// Firewall that only records requested operations.
#[derive(Debug, Default)]
pub struct DryRunFirewall {
    state: Mutex<DryRunState>,
}

impl DryRunFirewall {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls of `action` fail transiently.
    pub fn fail_next(&self, action: FirewallAction, count: u32) {
        self.inject(action, count, true);
    }

    /// Make the next `count` calls of `action` fail in a way retries cannot fix.
    pub fn reject_next(&self, action: FirewallAction, count: u32) {
        self.inject(action, count, false);
    }

    fn inject(&self, action: FirewallAction, remaining: u32, retryable: bool) {
        self.state.lock().failures.push(InjectedFailure {
            action,
            remaining,
            retryable,
        });
    }

    /// All calls that succeeded, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<FirewallCall> {
        self.state.lock().calls.clone()
    }

    /// Number of successful calls of `action` for `ip`.
    #[must_use]
    pub fn count(&self, action: FirewallAction, ip: IpAddr) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.action == action && call.ip == ip)
            .count()
    }

    fn apply(&self, action: FirewallAction, ip: IpAddr) -> WatchResult<()> {
        let mut state = self.state.lock();
        if let Some(slot) = state
            .failures
            .iter_mut()
            .find(|f| f.action == action && f.remaining > 0)
        {
            slot.remaining -= 1;
            return Err(if slot.retryable {
                WatchError::FirewallCommand {
                    ip,
                    action,
                    reason: "injected failure".to_string(),
                }
            } else {
                WatchError::Config(format!("{action} rejected"))
            });
        }
        state.calls.push(FirewallCall { action, ip });
        info!(ip = %ip, action = %action, "dry-run firewall command");
        Ok(())
    }
}

impl FirewallControl for DryRunFirewall {
    async fn prepare(&self) -> WatchResult<()> {
        Ok(())
    }

    async fn insert_drop_rule(&self, ip: IpAddr) -> WatchResult<()> {
        self.apply(FirewallAction::Insert, ip)
    }

    async fn remove_drop_rule(&self, ip: IpAddr) -> WatchResult<()> {
        self.apply(FirewallAction::Remove, ip)
    }
}
