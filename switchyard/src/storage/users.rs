//! Admin user records (auth boundary)

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Storage;
use crate::{
    error::{Error, Result},
    models::User,
};

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    email: String,
    password_hash: String,
    created_at: DateTime<Utc>,
}

impl Storage {
    /// Insert a new admin user. The caller supplies a bcrypt hash, never a
    /// plaintext password.
    pub async fn create_user(&self, email: &str, password_hash: &str) -> Result<User> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM users WHERE email = $1)")
                .bind(email)
                .fetch_one(self.pool())
                .await?;
        if exists {
            return Err(Error::BadRequest(format!("user {email} already exists")));
        }

        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO users (id, email, password_hash, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.created_at)
        .execute(self.pool())
        .await?;

        Ok(user)
    }

    /// Look up a user by email
    pub async fn get_user_by_email(&self, email: &str) -> Result<User> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, password_hash, created_at FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| Error::NotFound(format!("user {email}")))?;

        Ok(User {
            id: row.id,
            email: row.email,
            password_hash: row.password_hash,
            created_at: row.created_at,
        })
    }
}
