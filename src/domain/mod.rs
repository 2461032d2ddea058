//! Domain models for Tenant Authz

pub mod common;
pub mod decision;
pub mod policy;
pub mod rbac;
pub mod tenant;
pub mod user;

pub use common::*;
pub use decision::*;
pub use policy::*;
pub use rbac::*;
pub use tenant::*;
pub use user::*;
