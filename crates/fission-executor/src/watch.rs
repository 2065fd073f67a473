//! Catalog changes the executor reacts to.
//!
//! - Config map or secret data changed: functions that mount it get fresh
//!   pods.
//! - Environment deleted or revised: its pool goes away (a revised one is
//!   rebuilt on next use, or straight away when it keeps warm pods).
//! - Function changes: the deployment-backed kinds follow them; a deleted
//!   pool function loses its specialized pods.

use fission_core::{ExecutorType, FissionResult, Function};
use fission_state::{CatalogEvent, Change};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::context::ExecutorContext;
use crate::kind::Executors;

/// Consume catalog events until the store goes away.
pub async fn run(ctx: ExecutorContext, executors: Executors) {
    let mut events = ctx.store.watch();
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Err(e) = handle(&ctx, &executors, &event).await {
                    warn!(error = %e, "failed to apply catalog change");
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "catalog watcher lagged"),
            Err(RecvError::Closed) => {
                debug!("catalog watch closed");
                return;
            }
        }
    }
}

pub(crate) async fn handle(ctx: &ExecutorContext, executors: &Executors, event: &CatalogEvent) -> FissionResult<()> {
    match event {
        CatalogEvent::ConfigMap(Change::Updated { old, new }) if old.data != new.data => {
            let (ns, name) = (&new.metadata.namespace, &new.metadata.name);
            refresh(ctx, executors, |f| {
                f.spec
                    .config_maps
                    .iter()
                    .any(|r| r.name == *name && ref_namespace(&r.namespace, f) == ns)
            })
            .await
        }
        CatalogEvent::Secret(Change::Updated { old, new }) if old.data != new.data => {
            let (ns, name) = (&new.metadata.namespace, &new.metadata.name);
            refresh(ctx, executors, |f| {
                f.spec
                    .secrets
                    .iter()
                    .any(|r| r.name == *name && ref_namespace(&r.namespace, f) == ns)
            })
            .await
        }
        CatalogEvent::Environment(Change::Added(env)) if env.spec.poolsize > 0 => {
            executors.poolmgr.pool(env).await.map(|_| ())
        }
        CatalogEvent::Environment(Change::Updated { old, new })
            if old.metadata.resource_version != new.metadata.resource_version =>
        {
            executors.poolmgr.destroy_pool(&old.metadata.uid).await?;
            if new.spec.poolsize > 0 {
                executors.poolmgr.pool(new).await?;
            }
            Ok(())
        }
        CatalogEvent::Environment(Change::Deleted(env)) => {
            info!(environment = %env.metadata.name, "environment deleted, removing its pool");
            executors.poolmgr.destroy_pool(&env.metadata.uid).await
        }
        CatalogEvent::Function(change) => {
            if let Change::Deleted(f) = change {
                if f.executor_type() == ExecutorType::Poolmgr {
                    executors.poolmgr.function_deleted(&f.metadata).await?;
                }
            }
            executors.newdeploy.on_function_change(change).await?;
            executors.container.on_function_change(change).await
        }
        _ => Ok(()),
    }
}

fn ref_namespace<'a>(namespace: &'a str, function: &'a Function) -> &'a str {
    if namespace.is_empty() {
        &function.metadata.namespace
    } else {
        namespace
    }
}

async fn refresh(
    ctx: &ExecutorContext,
    executors: &Executors,
    uses: impl Fn(&Function) -> bool,
) -> FissionResult<()> {
    for function in ctx.store.list::<Function>()?.into_iter().filter(|f| uses(f)) {
        let kind = executors.kind(function.executor_type());
        if let Err(e) = kind.refresh_func_pods(&function).await {
            warn!(function = %function.metadata.name, error = %e, "failed to refresh function pods");
        }
    }
    Ok(())
}
