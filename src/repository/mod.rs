//! Data access layer (Repository pattern)

pub mod policy;
pub mod rbac;
pub mod tenant;
pub mod user;

pub use policy::{PolicyRepository, PolicyRepositoryImpl};
pub use rbac::{RbacRepository, RbacRepositoryImpl};
pub use tenant::{TenantRepository, TenantRepositoryImpl};
pub use user::{UserRepository, UserRepositoryImpl};
