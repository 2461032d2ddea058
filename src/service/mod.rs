//! Business logic layer

pub mod access;
pub mod assignment;
pub mod loader;
pub mod policy_store;
pub mod role;
pub mod tenant;

pub use access::{AccessService, CancelHandle, CancelSignal};
pub use assignment::AssignmentLedger;
pub use loader::{PolicyDrift, PolicyLoader};
pub use policy_store::PolicyStore;
pub use role::RoleCatalog;
pub use tenant::TenantService;
