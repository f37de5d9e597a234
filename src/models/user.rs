//! Users known to the catalog and the roles they hold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Role stored per user. Admins may mutate the catalog.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// A user record, created the first time a verified identity is seen.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,

    /// Subject claim from the most recent verified token.
    pub subject_id: String,

    /// Unique; used to match tokens to users.
    pub email: String,

    pub display_name: String,

    pub role: Role,

    pub created_at: DateTime<Utc>,
}

/// The caller of the current request, resolved by the auth gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject_id: String,
    pub email: String,
    pub role: Role,
}

impl Identity {
    /// Only admins may create, edit or remove songs.
    pub fn can_manage_catalog(&self) -> bool {
        self.role == Role::Admin
    }
}

impl From<User> for Identity {
    fn from(user: User) -> Self {
        Self {
            subject_id: user.subject_id,
            email: user.email,
            role: user.role,
        }
    }
}
