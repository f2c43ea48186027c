//! Keeps the protocols installed on a DWN in line with the registry.
//!
//! A run has two strictly ordered phases. Every install or update is issued
//! and settled locally first; only then are the configured protocols pushed to
//! the target DID. Local failures fail the run, push failures do not.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::canonical::canonically_equal;
use crate::definition_fingerprint;
use crate::error::ReconcileError;
use crate::registry::{ProtocolDefinition, ProtocolEntry, ProtocolRegistry};

/// Protocol access on a local DWN
#[async_trait]
pub trait ProtocolStore: Send + Sync {
    async fn query_protocols(&self) -> anyhow::Result<Vec<InstalledProtocol>>;

    async fn configure_protocol(
        &self,
        definition: &ProtocolDefinition,
    ) -> anyhow::Result<Box<dyn ConfiguredProtocol>>;
}

/// Handle to a freshly configured protocol that can be pushed to a DID's DWN
#[async_trait]
pub trait ConfiguredProtocol: Send + Sync {
    async fn send(&self, target_did: &str) -> anyhow::Result<()>;
}

/// A protocol definition as the store currently holds it
#[derive(Clone, Debug, PartialEq)]
pub struct InstalledProtocol {
    pub definition: Value,
}

impl InstalledProtocol {
    pub fn protocol_uri(&self) -> Option<&str> {
        self.definition.get("protocol").and_then(Value::as_str)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigureAction {
    Install,
    Update,
}

#[derive(Clone, Debug)]
pub struct PlannedConfigure<'r> {
    pub action: ConfigureAction,
    pub entry: &'r ProtocolEntry,
}

#[derive(Clone, Debug, Default)]
pub struct ReconcilePlan<'r> {
    pub operations: Vec<PlannedConfigure<'r>>,
    pub unchanged: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub installed: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub replicated: Vec<String>,
    pub replication_failures: Vec<ReconcileError>,
}

impl ReconcileReport {
    pub fn configured(&self) -> usize {
        self.installed.len() + self.updated.len()
    }
}

pub struct Reconciler<'r> {
    registry: &'r ProtocolRegistry,
    call_timeout: Option<Duration>,
}

impl<'r> Reconciler<'r> {
    pub fn new(registry: &'r ProtocolRegistry) -> Self {
        Self {
            registry,
            call_timeout: None,
        }
    }

    /// Bound every store call; an expired call counts as a failed call
    pub fn with_call_timeout(mut self, limit: Duration) -> Self {
        self.call_timeout = Some(limit);
        self
    }

    /// Diff the registry against what is installed
    pub fn plan(&self, installed: &[InstalledProtocol]) -> ReconcilePlan<'r> {
        let mut plan = ReconcilePlan::default();
        for entry in self.registry.all() {
            let desired = entry.definition.to_value();
            let existing = installed
                .iter()
                .find(|record| record.protocol_uri() == Some(entry.uri.as_str()));

            match existing {
                None => {
                    info!(protocol = %entry.uri, "installing protocol");
                    plan.operations.push(PlannedConfigure {
                        action: ConfigureAction::Install,
                        entry,
                    });
                }
                Some(record) if !canonically_equal(&record.definition, &desired) => {
                    info!(
                        protocol = %entry.uri,
                        installed = definition_fingerprint(&record.definition),
                        desired = definition_fingerprint(&desired),
                        "updating protocol"
                    );
                    plan.operations.push(PlannedConfigure {
                        action: ConfigureAction::Update,
                        entry,
                    });
                }
                Some(_) => {
                    info!(protocol = %entry.uri, "protocol already installed");
                    plan.unchanged.push(entry.uri.clone());
                }
            }
        }
        plan
    }

    pub async fn run<S>(&self, store: &S, target_did: &str) -> Result<ReconcileReport, ReconcileError>
    where
        S: ProtocolStore + ?Sized,
    {
        let installed = self.bounded(store.query_protocols()).await.map_err(|e| {
            error!(error = %e, "local query of installed protocols failed");
            ReconcileError::LocalQueryFailed(e)
        })?;

        let plan = self.plan(&installed);
        let mut report = ReconcileReport {
            unchanged: plan.unchanged,
            ..Default::default()
        };
        if plan.operations.is_empty() {
            return Ok(report);
        }

        let configured = join_all(plan.operations.iter().map(|op| async move {
            let result = self.bounded(store.configure_protocol(&op.entry.definition)).await;
            (op, result)
        }))
        .await;

        let mut handles = Vec::with_capacity(configured.len());
        let mut failure = None;
        for (op, result) in configured {
            match result {
                Ok(handle) => {
                    match op.action {
                        ConfigureAction::Install => report.installed.push(op.entry.uri.clone()),
                        ConfigureAction::Update => report.updated.push(op.entry.uri.clone()),
                    }
                    handles.push((op.entry, handle));
                }
                Err(source) => {
                    error!(protocol = %op.entry.uri, error = %source, "local install of configuration failed");
                    failure.get_or_insert(ReconcileError::LocalConfigureFailed {
                        protocol: op.entry.uri.clone(),
                        source,
                    });
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let sent = join_all(handles.iter().map(|(entry, handle)| async move {
            (*entry, self.bounded(handle.send(target_did)).await)
        }))
        .await;

        for (entry, result) in sent {
            match result {
                Ok(()) => {
                    debug!(protocol = %entry.uri, target = target_did, "configuration replicated");
                    report.replicated.push(entry.uri.clone());
                }
                Err(source) => {
                    warn!(protocol = %entry.uri, target = target_did, error = %source, "remote replication failed");
                    report.replication_failures.push(ReconcileError::ReplicationFailed {
                        protocol: entry.uri.clone(),
                        target: target_did.to_string(),
                        source,
                    });
                }
            }
        }

        Ok(report)
    }

    async fn bounded<T, F>(&self, call: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| anyhow::anyhow!("store call timed out after {limit:?}"))?,
            None => call.await,
        }
    }
}

/// Install or update the built-in protocols, then push them to `target_did`.
///
/// Returns `false` only when the local store could not be brought up to date.
pub async fn reconcile<S>(store: &S, target_did: &str) -> bool
where
    S: ProtocolStore + ?Sized,
{
    Reconciler::new(ProtocolRegistry::builtin())
        .run(store, target_did)
        .await
        .is_ok()
}
