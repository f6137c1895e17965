//! SQLite-backed plan repository.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::{parse_ts, storage, ts, SqliteDb};
use crate::repo::{Page, Plan, PlanRepo, PlanUpdate, RepoError};

pub struct SqlitePlanRepo {
    db: SqliteDb,
}

impl SqlitePlanRepo {
    pub fn new(db: SqliteDb) -> Self {
        Self { db }
    }
}

const COLUMNS: &str = "id, user_id, title, goal, tasks, created_at, updated_at, is_active";

fn row_to_plan(row: &Row<'_>) -> rusqlite::Result<Plan> {
    let tasks: String = row.get(4)?;
    Ok(Plan {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        goal: row.get(3)?,
        tasks: serde_json::from_str(&tasks).unwrap_or_default(),
        created_at: parse_ts(&row.get::<_, String>(5)?),
        updated_at: parse_ts(&row.get::<_, String>(6)?),
        is_active: row.get::<_, i64>(7)? != 0,
    })
}

#[async_trait]
impl PlanRepo for SqlitePlanRepo {
    async fn create(&self, plan: &Plan) -> Result<(), RepoError> {
        if plan.tasks.is_empty() {
            return Err(RepoError::InvalidInput(
                "a plan needs at least one task".into(),
            ));
        }
        let p = plan.clone();
        self.db
            .with_conn(move |conn| {
                let tasks =
                    serde_json::to_string(&p.tasks).map_err(|e| RepoError::Storage(e.to_string()))?;
                conn.execute(
                    r#"
                    INSERT INTO plans (id, user_id, title, goal, tasks, created_at, updated_at, is_active)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    "#,
                    params![
                        p.id,
                        p.user_id,
                        p.title,
                        p.goal,
                        tasks,
                        ts(p.created_at),
                        ts(p.updated_at),
                        p.is_active as i64,
                    ],
                )
                .map_err(storage)?;
                Ok(())
            })
            .await
    }

    async fn find_by_id(&self, id: &str, user_id: &str) -> Result<Option<Plan>, RepoError> {
        let (id, user_id) = (id.to_string(), user_id.to_string());
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {COLUMNS} FROM plans
                         WHERE id = ?1 AND user_id = ?2 AND is_active = 1"
                    ),
                    params![id, user_id],
                    row_to_plan,
                )
                .optional()
                .map_err(storage)
            })
            .await
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        limit: u32,
        skip: u32,
    ) -> Result<Page<Plan>, RepoError> {
        let user_id = user_id.to_string();
        self.db
            .with_conn(move |conn| {
                let total: u64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM plans WHERE user_id = ?1 AND is_active = 1",
                        params![user_id],
                        |row| row.get::<_, i64>(0),
                    )
                    .map_err(storage)? as u64;
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {COLUMNS} FROM plans
                         WHERE user_id = ?1 AND is_active = 1
                         ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3"
                    ))
                    .map_err(storage)?;
                let items = stmt
                    .query_map(params![user_id, limit as i64, skip as i64], row_to_plan)
                    .map_err(storage)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(storage)?;
                Ok(Page { items, total })
            })
            .await
    }

    async fn update(&self, id: &str, user_id: &str, update: PlanUpdate) -> Result<Plan, RepoError> {
        if update.is_empty() {
            return Err(RepoError::InvalidInput(
                "update must change title, goal, or tasks".into(),
            ));
        }
        if update.tasks.as_ref().is_some_and(|t| t.is_empty()) {
            return Err(RepoError::InvalidInput(
                "a plan needs at least one task".into(),
            ));
        }
        let (id, user_id) = (id.to_string(), user_id.to_string());
        let now = ts(Utc::now());
        self.db
            .with_conn(move |conn| {
                let current = conn
                    .query_row(
                        &format!(
                            "SELECT {COLUMNS} FROM plans
                             WHERE id = ?1 AND user_id = ?2 AND is_active = 1"
                        ),
                        params![id, user_id],
                        row_to_plan,
                    )
                    .optional()
                    .map_err(storage)?
                    .ok_or(RepoError::NotFound)?;

                let title = update.title.unwrap_or(current.title);
                let goal = update.goal.unwrap_or(current.goal);
                let tasks = update.tasks.unwrap_or(current.tasks);
                let tasks_json =
                    serde_json::to_string(&tasks).map_err(|e| RepoError::Storage(e.to_string()))?;
                conn.execute(
                    "UPDATE plans SET title = ?1, goal = ?2, tasks = ?3, updated_at = ?4
                     WHERE id = ?5 AND user_id = ?6",
                    params![title, goal, tasks_json, now, id, user_id],
                )
                .map_err(storage)?;
                conn.query_row(
                    &format!("SELECT {COLUMNS} FROM plans WHERE id = ?1 AND user_id = ?2"),
                    params![id, user_id],
                    row_to_plan,
                )
                .map_err(storage)
            })
            .await
    }

    async fn soft_delete(&self, id: &str, user_id: &str) -> Result<(), RepoError> {
        let (id, user_id) = (id.to_string(), user_id.to_string());
        self.db
            .with_conn(move |conn| {
                let changed = conn
                    .execute(
                        "UPDATE plans SET is_active = 0 WHERE id = ?1 AND user_id = ?2",
                        params![id, user_id],
                    )
                    .map_err(storage)?;
                if changed == 0 {
                    return Err(RepoError::NotFound);
                }
                Ok(())
            })
            .await
    }
}
