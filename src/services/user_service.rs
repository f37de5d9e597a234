//! Maps verified identities to stored users and their roles.

use crate::{
    models::user::{Role, User},
    services::identity::VerifiedToken,
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct UserDirectory {
    pub db: Arc<SqlitePool>,
}

impl UserDirectory {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Return the stored user for a verified token, creating it with the
    /// `user` role on first sight. The subject claim is refreshed each time.
    pub async fn resolve(&self, token: &VerifiedToken) -> Result<User, sqlx::Error> {
        let display_name = token
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| display_name_from_email(&token.email));

        sqlx::query_as::<_, User>(
            "INSERT INTO users (id, subject_id, email, display_name, role, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(email) DO UPDATE SET subject_id = excluded.subject_id
             RETURNING id, subject_id, email, display_name, role, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(&token.subject_id)
        .bind(&token.email)
        .bind(display_name)
        .bind(Role::User)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await
    }

    /// Grant the admin role to each email, creating placeholder users for
    /// emails that have not signed in yet.
    pub async fn seed_admins(&self, emails: &[String]) -> Result<(), sqlx::Error> {
        for email in emails {
            let email = email.trim().to_ascii_lowercase();
            if email.is_empty() {
                continue;
            }
            sqlx::query(
                "INSERT INTO users (id, subject_id, email, display_name, role, created_at)
                 VALUES (?, '', ?, ?, ?, ?)
                 ON CONFLICT(email) DO UPDATE SET role = excluded.role",
            )
            .bind(Uuid::new_v4())
            .bind(&email)
            .bind(display_name_from_email(&email))
            .bind(Role::Admin)
            .bind(Utc::now())
            .execute(&*self.db)
            .await?;
            tracing::info!("granted admin role to {}", email);
        }
        Ok(())
    }
}

fn display_name_from_email(email: &str) -> String {
    email.split('@').next().unwrap_or(email).to_string()
}
