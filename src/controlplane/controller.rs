//! ContainerStorageModule controller
//!
//! Watches custom resources and drives the engine through a finalizer:
//! `Apply` installs and writes status, `Cleanup` uninstalls before the
//! resource is allowed to go away.

use crate::controlplane::engine::{ModuleEngine, ReconcileMode};
use crate::crd::ContainerStorageModule;
use crate::error::{Error, ErrorAction, Result};
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{self, finalizer, Event as Finalizer};
use kube::runtime::watcher;
use kube::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Finalizer held until module and driver objects are removed
pub const FINALIZER: &str = "storage.dell.com/csm-module-operator";

/// Requeue interval while a module is failing
const FAILED_MODULE_REQUEUE: Duration = Duration::from_secs(60);

/// Requeue interval for transient errors
const BACKOFF_REQUEUE: Duration = Duration::from_secs(15);

/// Shared state for reconcile calls
pub struct Context {
    pub client: Client,
    pub engine: ModuleEngine,
    pub cancel: CancellationToken,
}

fn api_for(client: &Client, csm: &ContainerStorageModule) -> Api<ContainerStorageModule> {
    Api::namespaced(client.clone(), csm.namespace())
}

/// Reconcile entry point handed to the runtime
pub async fn reconcile(csm: Arc<ContainerStorageModule>, ctx: Arc<Context>) -> Result<Action> {
    let api = api_for(&ctx.client, &csm);

    finalizer(&api, FINALIZER, csm, |event| async {
        match event {
            Finalizer::Apply(csm) => apply(&csm, &ctx).await,
            Finalizer::Cleanup(csm) => cleanup(&csm, &ctx).await,
        }
    })
    .await
    .map_err(|e| match e {
        finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => e,
        other => Error::Finalizer(other.to_string()),
    })
}

async fn apply(csm: &ContainerStorageModule, ctx: &Context) -> Result<Action> {
    let report = ctx.engine.run(csm, ReconcileMode::Install, &ctx.cancel).await?;

    let status = report.to_status();
    let patch = json!({ "status": status });
    let params = PatchParams::apply(&ctx.engine.config().field_manager);
    api_for(&ctx.client, csm)
        .patch_status(csm.name(), &params, &Patch::Merge(&patch))
        .await?;
    debug!("Updated status of {}/{}", csm.namespace(), csm.name());

    if report.is_success() {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(FAILED_MODULE_REQUEUE))
    }
}

async fn cleanup(csm: &ContainerStorageModule, ctx: &Context) -> Result<Action> {
    info!("Removing {}/{}", csm.namespace(), csm.name());
    let report = ctx.engine.run(csm, ReconcileMode::Uninstall, &ctx.cancel).await?;

    let failures = report.failures();
    if !failures.is_empty() {
        return Err(Error::Internal(format!(
            "uninstall of {} incomplete: {}",
            csm.name(),
            failures.join("; ")
        )));
    }
    Ok(Action::await_change())
}

/// Map an error to a requeue decision
pub fn error_policy(csm: Arc<ContainerStorageModule>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!("Reconcile of {}/{} failed: {}", csm.namespace(), csm.name(), error);
    requeue_action(error.action())
}

fn requeue_action(action: ErrorAction) -> Action {
    match action {
        ErrorAction::RequeueWithBackoff => Action::requeue(BACKOFF_REQUEUE),
        ErrorAction::RequeueAfter(after) => Action::requeue(after),
        ErrorAction::NoRequeue => Action::await_change(),
    }
}

/// Run the controller until a shutdown signal arrives
pub async fn run(client: Client, engine: ModuleEngine, watch_namespace: Option<String>) {
    let api: Api<ContainerStorageModule> = match &watch_namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    info!(
        "Watching ContainerStorageModules in {}",
        watch_namespace.as_deref().unwrap_or("all namespaces")
    );

    let cancel = CancellationToken::new();
    let ctx = Arc::new(Context {
        client,
        engine,
        cancel: cancel.clone(),
    });

    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!("Reconciled {}", object.name),
                Err(e) => warn!("Controller error: {}", e),
            }
        })
        .await;

    cancel.cancel();
    info!("Controller stopped");
}
