//! Workflow orchestrator client.
//!
//! State transitions fan out side effects (provisioning, inventory
//! updates, decommissioning cleanup, search reindexing) as jobs
//! submitted to the orchestrator. Submission happens before the local
//! commit, so a failed submission aborts the transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;

use crate::models::Device;

/// Provisioning workflow input, fired when a device first becomes
/// accepted.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionDeviceReq {
    pub request_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tenant_id: String,
    pub device_id: String,
    pub device: Device,
    pub status: String,
}

/// Decommissioning workflow input, fired before the device record is
/// removed.
#[derive(Debug, Clone, Serialize)]
pub struct DecommissioningReq {
    pub request_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tenant_id: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInventoryUpdate {
    pub id: String,
    pub revision: u32,
}

/// Inventory status propagation. The status is a free string because
/// deleted devices propagate the out-of-band "decommissioned" value.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateDeviceStatusReq {
    pub request_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tenant_id: String,
    pub devices: Vec<DeviceInventoryUpdate>,
    pub status: String,
}

/// Inventory attribute write; `attributes` is a pre-serialized JSON
/// array of attribute objects.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateDeviceInventoryReq {
    pub request_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tenant_id: String,
    pub device_id: String,
    pub scope: String,
    pub attributes: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReindexReq {
    pub request_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tenant_id: String,
    pub device_id: String,
    pub service: String,
}

#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    async fn check_health(&self) -> Result<(), anyhow::Error>;

    async fn submit_provision_device(
        &self,
        req: ProvisionDeviceReq,
    ) -> Result<(), anyhow::Error>;
    async fn submit_decommission_device(
        &self,
        req: DecommissioningReq,
    ) -> Result<(), anyhow::Error>;
    async fn submit_update_device_status(
        &self,
        req: UpdateDeviceStatusReq,
    ) -> Result<(), anyhow::Error>;
    async fn submit_update_device_inventory(
        &self,
        req: UpdateDeviceInventoryReq,
    ) -> Result<(), anyhow::Error>;
    async fn submit_reindex(&self, req: ReindexReq) -> Result<(), anyhow::Error>;
}

/// Recorded job, for assertions on what a flow submitted and in which
/// order.
#[derive(Debug, Clone)]
pub enum OrchestratorJob {
    ProvisionDevice(ProvisionDeviceReq),
    DecommissionDevice(DecommissioningReq),
    UpdateDeviceStatus(UpdateDeviceStatusReq),
    UpdateDeviceInventory(UpdateDeviceInventoryReq),
    Reindex(ReindexReq),
}

/// In-memory orchestrator recording submitted jobs; can be switched
/// into a failing mode to exercise abort paths.
#[derive(Default)]
pub struct MockOrchestrator {
    pub jobs: Mutex<Vec<OrchestratorJob>>,
    fail: AtomicBool,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().map(|j| j.len()).unwrap_or(0)
    }

    fn record(&self, job: OrchestratorJob) -> Result<(), anyhow::Error> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("orchestrator unavailable");
        }
        self.jobs
            .lock()
            .map_err(|e| anyhow::anyhow!("jobs mutex poisoned: {}", e))?
            .push(job);
        Ok(())
    }
}

#[async_trait]
impl OrchestratorClient for MockOrchestrator {
    async fn check_health(&self) -> Result<(), anyhow::Error> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("orchestrator unavailable");
        }
        Ok(())
    }

    async fn submit_provision_device(
        &self,
        req: ProvisionDeviceReq,
    ) -> Result<(), anyhow::Error> {
        self.record(OrchestratorJob::ProvisionDevice(req))
    }

    async fn submit_decommission_device(
        &self,
        req: DecommissioningReq,
    ) -> Result<(), anyhow::Error> {
        self.record(OrchestratorJob::DecommissionDevice(req))
    }

    async fn submit_update_device_status(
        &self,
        req: UpdateDeviceStatusReq,
    ) -> Result<(), anyhow::Error> {
        self.record(OrchestratorJob::UpdateDeviceStatus(req))
    }

    async fn submit_update_device_inventory(
        &self,
        req: UpdateDeviceInventoryReq,
    ) -> Result<(), anyhow::Error> {
        self.record(OrchestratorJob::UpdateDeviceInventory(req))
    }

    async fn submit_reindex(&self, req: ReindexReq) -> Result<(), anyhow::Error> {
        self.record(OrchestratorJob::Reindex(req))
    }
}
