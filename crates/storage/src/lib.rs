use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use delivery::MembershipSource;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{GroupId, GroupMember, Role, UserId};

/// Authoritative store for group membership and durable ban/mute records.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMute {
    pub user_id: UserId,
    /// Unix millis.
    pub expire_at: i64,
}

#[derive(Debug, Clone)]
pub struct StoredBan {
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Inserts or updates a membership. Returns `true` when the user was not
    /// a member before.
    pub async fn add_group_member(
        &self,
        group_id: GroupId,
        user_id: UserId,
        role: Role,
    ) -> Result<bool> {
        let existed = sqlx::query("SELECT 1 FROM group_members WHERE group_id = ? AND user_id = ?")
            .bind(group_id.0)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        sqlx::query(
            "INSERT INTO group_members (group_id, user_id, role) VALUES (?, ?, ?)
             ON CONFLICT(group_id, user_id) DO UPDATE SET role=excluded.role",
        )
        .bind(group_id.0)
        .bind(user_id.0)
        .bind(role.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to add user {user_id} to group {group_id}"))?;
        Ok(!existed)
    }

    pub async fn remove_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
            .bind(group_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_group_members(&self, group_id: GroupId) -> Result<Vec<GroupMember>> {
        let rows = sqlx::query(
            "SELECT user_id, role FROM group_members WHERE group_id = ? ORDER BY user_id ASC",
        )
        .bind(group_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let raw_role = r.get::<String, _>(1);
                let role = Role::parse(&raw_role)
                    .with_context(|| format!("unknown role '{raw_role}' in group {group_id}"))?;
                Ok(GroupMember {
                    user_id: UserId(r.get::<i64, _>(0)),
                    role,
                })
            })
            .collect()
    }

    /// Returns `false` when the user was already banned.
    pub async fn ban_user(&self, user_id: UserId) -> Result<bool> {
        let result = sqlx::query("INSERT INTO bans (user_id) VALUES (?) ON CONFLICT(user_id) DO NOTHING")
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn unban_user(&self, user_id: UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM bans WHERE user_id = ?")
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_bans(&self) -> Result<Vec<StoredBan>> {
        let rows = sqlx::query("SELECT user_id, created_at FROM bans ORDER BY user_id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredBan {
                user_id: UserId(r.get::<i64, _>(0)),
                created_at: r.get::<DateTime<Utc>, _>(1),
            })
            .collect())
    }

    /// Mutes until `expire_at` (unix millis), replacing any earlier mute.
    pub async fn mute_user(&self, user_id: UserId, expire_at: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO mutes (user_id, expire_at) VALUES (?, ?)
             ON CONFLICT(user_id) DO UPDATE SET expire_at=excluded.expire_at, created_at=CURRENT_TIMESTAMP",
        )
        .bind(user_id.0)
        .bind(expire_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unmute_user(&self, user_id: UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM mutes WHERE user_id = ?")
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mutes still in force at `now` (unix millis).
    pub async fn list_active_mutes(&self, now: i64) -> Result<Vec<StoredMute>> {
        let rows = sqlx::query(
            "SELECT user_id, expire_at FROM mutes WHERE expire_at > ? ORDER BY expire_at ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredMute {
                user_id: UserId(r.get::<i64, _>(0)),
                expire_at: r.get::<i64, _>(1),
            })
            .collect())
    }
}

#[async_trait]
impl MembershipSource for Storage {
    async fn group_members(&self, group: GroupId) -> Result<Vec<GroupMember>> {
        self.list_group_members(group)
            .await
            .with_context(|| format!("failed to load members of group {group}"))
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
