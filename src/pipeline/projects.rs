//! Project (tenant) resolution and administration.
//!
//! Ingestion resolves projects by slug and may auto-provision them for
//! callers inside the trust zone; the Edge creates them explicitly for
//! logged-in users. API keys are returned in plaintext exactly once and
//! stored only as bcrypt hashes.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProjectError {
    /// Unknown slug and the caller is outside the trust zone.
    #[error("project not found")]
    NotFound,
    /// The slug exists but the project was deactivated; ingestion is denied.
    #[error("project is deactivated")]
    Inactive,
    #[error("slug is already taken")]
    SlugTaken,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("key hashing failed")]
    Hash,
}

#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: String,
    pub user_id: Option<String>,
    pub slug: String,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

fn generate_api_key() -> String {
    let mut raw = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    format!("dsk_{}", URL_SAFE_NO_PAD.encode(raw))
}

async fn hash_key(key: String) -> Result<String, ProjectError> {
    // bcrypt is CPU-bound; keep it off the async workers.
    tokio::task::spawn_blocking(move || bcrypt::hash(key, bcrypt::DEFAULT_COST))
        .await
        .map_err(|_| ProjectError::Hash)?
        .map_err(|_| ProjectError::Hash)
}

/// Resolves the project for an ingestion request.
///
/// Internal callers (loopback / private network) get auto-provisioning:
/// an unknown slug becomes a live project owned by nobody. External callers
/// must hit an existing active project.
pub async fn resolve_for_ingest(
    pool: &SqlitePool,
    slug: &str,
    internal: bool,
) -> Result<String, ProjectError> {
    let row = sqlx::query(
        "SELECT id, is_active FROM projects WHERE slug = ? ORDER BY is_active DESC LIMIT 1",
    )
    .bind(slug)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let active: i64 = row.get("is_active");
            if active == 1 {
                Ok(row.get("id"))
            } else {
                Err(ProjectError::Inactive)
            }
        }
        None if internal => auto_provision(pool, slug).await,
        None => Err(ProjectError::NotFound),
    }
}

/// Creates a live project with `user_id = NULL`. The generated API key is
/// hashed and discarded; internal producers never authenticate with it.
async fn auto_provision(pool: &SqlitePool, slug: &str) -> Result<String, ProjectError> {
    let id = Uuid::new_v4().to_string();
    let key_hash = hash_key(generate_api_key()).await?;

    let inserted = sqlx::query(
        "INSERT INTO projects (id, user_id, slug, name, api_key_hash, is_active, created_at)
         VALUES (?, NULL, ?, ?, ?, 1, ?)
         ON CONFLICT DO NOTHING",
    )
    .bind(&id)
    .bind(slug)
    .bind(slug)
    .bind(&key_hash)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    if inserted.rows_affected() == 1 {
        tracing::info!("🆕 [Ingest] Auto-provisioned project '{}'", slug);
        return Ok(id);
    }
    // Lost a provisioning race; the winner's row is live now.
    let (winner,): (String,) =
        sqlx::query_as("SELECT id FROM projects WHERE slug = ? AND is_active = 1")
            .bind(slug)
            .fetch_one(pool)
            .await?;
    Ok(winner)
}

/// Explicit creation through the authenticated admin surface.
/// Returns the project and the plaintext key, shown to the caller once.
pub async fn create_project(
    pool: &SqlitePool,
    user_id: &str,
    slug: &str,
    name: &str,
) -> Result<(Project, String), ProjectError> {
    let api_key = generate_api_key();
    let key_hash = hash_key(api_key.clone()).await?;
    let project = Project {
        id: Uuid::new_v4().to_string(),
        user_id: Some(user_id.to_string()),
        slug: slug.to_string(),
        name: name.to_string(),
        is_active: true,
        created_at: Utc::now(),
    };

    let result = sqlx::query(
        "INSERT INTO projects (id, user_id, slug, name, api_key_hash, is_active, created_at)
         VALUES (?, ?, ?, ?, ?, 1, ?)",
    )
    .bind(&project.id)
    .bind(&project.user_id)
    .bind(&project.slug)
    .bind(&project.name)
    .bind(&key_hash)
    .bind(project.created_at)
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok((project, api_key)),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(ProjectError::SlugTaken),
        Err(e) => Err(e.into()),
    }
}

/// Replaces the API key hash. Returns the new plaintext key, or None when
/// the project does not exist.
pub async fn regenerate_key(
    pool: &SqlitePool,
    project_id: &str,
) -> Result<Option<String>, ProjectError> {
    let api_key = generate_api_key();
    let key_hash = hash_key(api_key.clone()).await?;
    let updated = sqlx::query("UPDATE projects SET api_key_hash = ? WHERE id = ?")
        .bind(&key_hash)
        .bind(project_id)
        .execute(pool)
        .await?;
    Ok((updated.rows_affected() == 1).then_some(api_key))
}

/// Soft-deactivation: logs are retained, new ingestion is denied, and the
/// slug becomes reusable by a future project.
pub async fn deactivate(pool: &SqlitePool, project_id: &str) -> Result<bool, ProjectError> {
    let updated = sqlx::query("UPDATE projects SET is_active = 0 WHERE id = ? AND is_active = 1")
        .bind(project_id)
        .execute(pool)
        .await?;
    Ok(updated.rows_affected() == 1)
}

pub async fn list_projects(pool: &SqlitePool, user_id: &str) -> Result<Vec<Project>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, user_id, slug, name, is_active, created_at
         FROM projects WHERE user_id = ? ORDER BY created_at DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| Project {
            id: row.get("id"),
            user_id: row.get("user_id"),
            slug: row.get("slug"),
            name: row.get("name"),
            is_active: row.get::<i64, _>("is_active") == 1,
            created_at: row.get("created_at"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn internal_unknown_slug_auto_provisions() {
        let pool = test_pool().await;
        let id = resolve_for_ingest(&pool, "acme", true).await.unwrap();
        // Second resolve finds the same project.
        let again = resolve_for_ingest(&pool, "acme", true).await.unwrap();
        assert_eq!(id, again);

        let (user_id,): (Option<String>,) =
            sqlx::query_as("SELECT user_id FROM projects WHERE slug = 'acme'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(user_id.is_none(), "auto-provisioned projects are unowned");
    }

    #[tokio::test]
    async fn external_unknown_slug_is_404() {
        let pool = test_pool().await;
        assert!(matches!(
            resolve_for_ingest(&pool, "ghost", false).await,
            Err(ProjectError::NotFound)
        ));
    }

    #[tokio::test]
    async fn deactivated_project_denies_ingest() {
        let pool = test_pool().await;
        let (project, _) = create_project(&pool, "u-1", "acme", "Acme").await.unwrap();
        assert!(deactivate(&pool, &project.id).await.unwrap());

        assert!(matches!(
            resolve_for_ingest(&pool, "acme", false).await,
            Err(ProjectError::Inactive)
        ));
        // Internal callers are denied too; deactivation wins over provisioning.
        assert!(matches!(
            resolve_for_ingest(&pool, "acme", true).await,
            Err(ProjectError::Inactive)
        ));
    }

    #[tokio::test]
    async fn slug_unique_while_live() {
        let pool = test_pool().await;
        let (project, key) = create_project(&pool, "u-1", "acme", "Acme").await.unwrap();
        assert!(key.starts_with("dsk_"));

        assert!(matches!(
            create_project(&pool, "u-2", "acme", "Other").await,
            Err(ProjectError::SlugTaken)
        ));

        // After deactivation the slug is free again.
        deactivate(&pool, &project.id).await.unwrap();
        assert!(create_project(&pool, "u-2", "acme", "Other").await.is_ok());
    }

    #[tokio::test]
    async fn regenerate_replaces_hash() {
        let pool = test_pool().await;
        let (project, first) = create_project(&pool, "u-1", "acme", "Acme").await.unwrap();
        let (hash_before,): (String,) =
            sqlx::query_as("SELECT api_key_hash FROM projects WHERE id = ?")
                .bind(&project.id)
                .fetch_one(&pool)
                .await
                .unwrap();

        let second = regenerate_key(&pool, &project.id).await.unwrap().unwrap();
        assert_ne!(first, second);

        let (hash_after,): (String,) =
            sqlx::query_as("SELECT api_key_hash FROM projects WHERE id = ?")
                .bind(&project.id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_ne!(hash_before, hash_after);
        assert!(regenerate_key(&pool, "missing").await.unwrap().is_none());
    }
}
