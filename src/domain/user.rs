//! User domain model
//!
//! Only the identity needed for authorization is modelled here; credentials
//! live with whatever authenticated the caller.

use super::common::StringUuid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// User entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: StringUuid,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for User {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: StringUuid::new_v4(),
            email: String::new(),
            display_name: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Input for registering a user
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateUserInput {
    #[validate(email)]
    pub email: String,
    #[validate(length(max = 255))]
    pub display_name: Option<String>,
}

impl CreateUserInput {
    /// Emails are stored lowercased so uniqueness is case-insensitive
    pub fn normalized_email(&self) -> String {
        self.email.trim().to_lowercase()
    }
}
