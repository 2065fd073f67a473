//! Dispatch over the executor kinds.

use std::sync::Arc;

use fission_core::{ExecutorType, FissionError, FissionResult, Function, ObjectMeta};
use fission_fscache::FuncSvc;

use crate::deploy::DeployManager;
use crate::poolmgr::GenericPoolManager;

/// One executor kind, tagged by strategy.
#[derive(Clone)]
pub enum ExecutorKind {
    Poolmgr(Arc<GenericPoolManager>),
    NewDeploy(Arc<DeployManager>),
    Container(Arc<DeployManager>),
}

impl ExecutorKind {
    pub fn executor_type(&self) -> ExecutorType {
        match self {
            Self::Poolmgr(_) => ExecutorType::Poolmgr,
            Self::NewDeploy(_) => ExecutorType::Newdeploy,
            Self::Container(_) => ExecutorType::Container,
        }
    }

    /// Create a new function service. For pool functions the caller holds
    /// one request slot on the result.
    pub async fn get_func_svc(&self, function: &Function) -> FissionResult<FuncSvc> {
        match self {
            Self::Poolmgr(gpm) => gpm.get_func_svc(function).await,
            Self::NewDeploy(m) | Self::Container(m) => m.get_func_svc(function).await,
        }
    }

    /// `NotFound` means nothing is cached and a new service is needed.
    pub async fn get_func_svc_from_cache(&self, function: &Function) -> FissionResult<FuncSvc> {
        match self {
            Self::Poolmgr(gpm) => gpm.get_func_svc_from_cache(function).await,
            Self::NewDeploy(m) | Self::Container(m) => m.get_func_svc_from_cache(function).await,
        }
    }

    pub async fn is_valid(&self, fsvc: &FuncSvc) -> bool {
        match self {
            Self::Poolmgr(gpm) => gpm.is_valid(fsvc).await,
            Self::NewDeploy(m) | Self::Container(m) => m.is_valid(fsvc).await,
        }
    }

    pub async fn delete_func_svc_from_cache(&self, fsvc: &FuncSvc) -> FissionResult<()> {
        match self {
            Self::Poolmgr(gpm) => gpm.delete_func_svc_from_cache(fsvc).await,
            Self::NewDeploy(m) | Self::Container(m) => m.delete_func_svc_from_cache(fsvc).await,
        }
    }

    pub async fn tap_service(&self, meta: &ObjectMeta, address: &str) -> FissionResult<()> {
        match self {
            Self::Poolmgr(gpm) => gpm.tap_service(meta, address).await,
            Self::NewDeploy(m) | Self::Container(m) => m.tap_service(address).await,
        }
    }

    /// Release a request slot. Only pool functions hold slots.
    pub async fn un_tap_service(&self, meta: &ObjectMeta, address: &str) -> FissionResult<()> {
        match self {
            Self::Poolmgr(gpm) => gpm.un_tap_service(meta, address).await,
            _ => Err(FissionError::invalid_argument(format!(
                "un-tap is not supported by the {} executor",
                self.executor_type()
            ))),
        }
    }

    /// Forget an address a caller could not use. Other executor types are
    /// re-resolved by the router itself.
    pub async fn invalidate_service(&self, meta: &ObjectMeta, address: &str) -> FissionResult<()> {
        match self {
            Self::Poolmgr(gpm) => gpm.invalidate_service(meta, address).await,
            _ => Err(FissionError::invalid_argument(format!(
                "invalidation is not supported by the {} executor",
                self.executor_type()
            ))),
        }
    }

    pub async fn refresh_func_pods(&self, function: &Function) -> FissionResult<()> {
        match self {
            Self::Poolmgr(gpm) => gpm.refresh_func_pods(function).await,
            Self::NewDeploy(m) | Self::Container(m) => m.refresh_func_pods(function).await,
        }
    }

    pub async fn adopt_existing_resources(&self) -> FissionResult<usize> {
        match self {
            Self::Poolmgr(gpm) => gpm.adopt_existing_resources().await,
            Self::NewDeploy(m) | Self::Container(m) => m.adopt_existing_resources().await,
        }
    }

    pub async fn cleanup_old_executor_objects(&self) -> FissionResult<usize> {
        match self {
            Self::Poolmgr(gpm) => gpm.cleanup_old_executor_objects().await,
            Self::NewDeploy(m) | Self::Container(m) => m.cleanup_old_executor_objects().await,
        }
    }

    pub async fn reap_idle(&self) -> FissionResult<usize> {
        match self {
            Self::Poolmgr(gpm) => gpm.reap_idle().await,
            Self::NewDeploy(m) | Self::Container(m) => m.reap_idle().await,
        }
    }
}

/// The three executor kinds of one executor process.
#[derive(Clone)]
pub struct Executors {
    pub poolmgr: Arc<GenericPoolManager>,
    pub newdeploy: Arc<DeployManager>,
    pub container: Arc<DeployManager>,
}

impl Executors {
    pub fn kind(&self, executor_type: ExecutorType) -> ExecutorKind {
        match executor_type {
            ExecutorType::Poolmgr => ExecutorKind::Poolmgr(self.poolmgr.clone()),
            ExecutorType::Newdeploy => ExecutorKind::NewDeploy(self.newdeploy.clone()),
            ExecutorType::Container => ExecutorKind::Container(self.container.clone()),
        }
    }

    pub fn all(&self) -> [ExecutorKind; 3] {
        [
            self.kind(ExecutorType::Poolmgr),
            self.kind(ExecutorType::Newdeploy),
            self.kind(ExecutorType::Container),
        ]
    }
}
