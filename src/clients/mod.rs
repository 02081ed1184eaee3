//! Clients for downstream services.

pub mod orchestrator;
pub mod tenant;

pub use orchestrator::{MockOrchestrator, OrchestratorClient};
pub use tenant::{MockTenantClient, Tenant, TenantClient, TenantClientError};
