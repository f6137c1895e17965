//! Plan CRUD tools, backed by the plan repository and scoped to the calling
//! user via the tool context.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::repo::{Plan, PlanRepo, PlanTask, PlanUpdate, RepoError};
use crate::tools::{ToolContext, ToolError, ToolMetadata, ToolPlugin, ToolResult};

/// All four plan tools over one shared repository.
pub fn plan_tools(repo: Arc<dyn PlanRepo>) -> Vec<Arc<dyn ToolPlugin>> {
    vec![
        Arc::new(PlanCreateTool { repo: Arc::clone(&repo) }),
        Arc::new(PlanListTool { repo: Arc::clone(&repo) }),
        Arc::new(PlanUpdateTool { repo: Arc::clone(&repo) }),
        Arc::new(PlanDeleteTool { repo }),
    ]
}

fn metadata(name: &str, description: &str) -> ToolMetadata {
    ToolMetadata {
        name: name.into(),
        version: "1.0.0".into(),
        description: description.into(),
        enabled: true,
    }
}

fn repo_failure(e: RepoError) -> Result<ToolResult, ToolError> {
    match e {
        RepoError::NotFound => Ok(ToolResult::fail("plan not found")),
        RepoError::InvalidInput(msg) => Ok(ToolResult::fail(msg)),
        other => Err(ToolError::Execution(other.to_string())),
    }
}

fn parse_tasks(params: &Value) -> Result<Option<Vec<PlanTask>>, ToolError> {
    match params.get("tasks") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| ToolError::Validation(format!("bad tasks: {e}"))),
    }
}

fn plan_to_value(plan: &Plan) -> Value {
    json!({
        "id": plan.id,
        "title": plan.title,
        "goal": plan.goal,
        "tasks": plan.tasks,
        "updatedAt": plan.updated_at.to_rfc3339(),
    })
}

pub struct PlanCreateTool {
    repo: Arc<dyn PlanRepo>,
}

#[async_trait]
impl ToolPlugin for PlanCreateTool {
    fn metadata(&self) -> ToolMetadata {
        metadata("plan_create", "Create a plan with a goal and task list")
    }

    fn schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": "plan_create",
                "description": "Create a new plan for the user. Tasks need a title; \
                                estimated_hours, deadline (ISO date), and tags are optional.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "title": { "type": "string" },
                        "goal": { "type": "string" },
                        "tasks": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "title": { "type": "string" },
                                    "estimated_hours": { "type": "number" },
                                    "deadline": { "type": "string" },
                                    "tags": { "type": "array", "items": { "type": "string" } }
                                },
                                "required": ["title"]
                            }
                        }
                    },
                    "required": ["title", "tasks"]
                }
            }
        })
    }

    fn validate(&self, params: &Value) -> Result<(), ToolError> {
        if params.get("title").and_then(Value::as_str).map(str::trim).unwrap_or("").is_empty() {
            return Err(ToolError::Validation("title must not be empty".into()));
        }
        if !params.get("tasks").map(|t| t.is_array()).unwrap_or(false) {
            return Err(ToolError::Validation("tasks must be an array".into()));
        }
        Ok(())
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let tasks = parse_tasks(&params)?.unwrap_or_default();
        let now = Utc::now();
        let plan = Plan {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: ctx.user_id.clone(),
            title: params.get("title").and_then(Value::as_str).unwrap_or("").to_string(),
            goal: params.get("goal").and_then(Value::as_str).unwrap_or("").to_string(),
            tasks,
            created_at: now,
            updated_at: now,
            is_active: true,
        };
        match self.repo.create(&plan).await {
            Ok(()) => Ok(ToolResult::ok(plan_to_value(&plan)).with_message("plan created")),
            Err(e) => repo_failure(e),
        }
    }
}

pub struct PlanListTool {
    repo: Arc<dyn PlanRepo>,
}

#[async_trait]
impl ToolPlugin for PlanListTool {
    fn metadata(&self) -> ToolMetadata {
        metadata("plan_list", "List the user's plans")
    }

    fn schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": "plan_list",
                "description": "List the user's active plans, most recently updated first.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "limit": { "type": "integer", "description": "Max plans to return (default 10)" }
                    }
                }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(10).clamp(1, 50) as u32;
        let page = self
            .repo
            .list_by_user(&ctx.user_id, limit, 0)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        let plans: Vec<Value> = page.items.iter().map(plan_to_value).collect();
        Ok(ToolResult::ok(json!({ "plans": plans, "total": page.total })))
    }
}

pub struct PlanUpdateTool {
    repo: Arc<dyn PlanRepo>,
}

#[async_trait]
impl ToolPlugin for PlanUpdateTool {
    fn metadata(&self) -> ToolMetadata {
        metadata("plan_update", "Update a plan's title, goal, or tasks")
    }

    fn schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": "plan_update",
                "description": "Update an existing plan. Provide plan_id and at least one of \
                                title, goal, or tasks (tasks replace the whole list).",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "plan_id": { "type": "string" },
                        "title": { "type": "string" },
                        "goal": { "type": "string" },
                        "tasks": { "type": "array", "items": { "type": "object" } }
                    },
                    "required": ["plan_id"]
                }
            }
        })
    }

    fn validate(&self, params: &Value) -> Result<(), ToolError> {
        if params.get("plan_id").and_then(Value::as_str).unwrap_or("").is_empty() {
            return Err(ToolError::Validation("plan_id is required".into()));
        }
        Ok(())
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let plan_id = params.get("plan_id").and_then(Value::as_str).unwrap_or("");
        let update = PlanUpdate {
            title: params.get("title").and_then(Value::as_str).map(str::to_string),
            goal: params.get("goal").and_then(Value::as_str).map(str::to_string),
            tasks: parse_tasks(&params)?,
        };
        match self.repo.update(plan_id, &ctx.user_id, update).await {
            Ok(plan) => Ok(ToolResult::ok(plan_to_value(&plan)).with_message("plan updated")),
            Err(e) => repo_failure(e),
        }
    }
}

pub struct PlanDeleteTool {
    repo: Arc<dyn PlanRepo>,
}

#[async_trait]
impl ToolPlugin for PlanDeleteTool {
    fn metadata(&self) -> ToolMetadata {
        metadata("plan_delete", "Delete a plan")
    }

    fn schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": "plan_delete",
                "description": "Delete one of the user's plans by id.",
                "parameters": {
                    "type": "object",
                    "properties": { "plan_id": { "type": "string" } },
                    "required": ["plan_id"]
                }
            }
        })
    }

    fn validate(&self, params: &Value) -> Result<(), ToolError> {
        if params.get("plan_id").and_then(Value::as_str).unwrap_or("").is_empty() {
            return Err(ToolError::Validation("plan_id is required".into()));
        }
        Ok(())
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let plan_id = params.get("plan_id").and_then(Value::as_str).unwrap_or("");
        match self.repo.soft_delete(plan_id, &ctx.user_id).await {
            Ok(()) => Ok(ToolResult::ok(json!({ "deleted": plan_id }))),
            Err(e) => repo_failure(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::sqlite::{test_db, SqlitePlanRepo};

    fn ctx(user: &str) -> ToolContext {
        ToolContext {
            user_id: user.into(),
            ..ToolContext::default()
        }
    }

    async fn tools() -> (tempfile::TempDir, Vec<Arc<dyn ToolPlugin>>) {
        let (dir, db) = test_db();
        let repo: Arc<dyn PlanRepo> = Arc::new(SqlitePlanRepo::new(db));
        (dir, plan_tools(repo))
    }

    #[tokio::test]
    async fn create_list_update_delete_cycle() {
        let (_dir, tools) = tools().await;
        let (create, list, update, delete) = (&tools[0], &tools[1], &tools[2], &tools[3]);

        let created = create
            .execute(
                json!({
                    "title": "Launch",
                    "goal": "ship v1",
                    "tasks": [{ "title": "write code", "estimated_hours": 6 }]
                }),
                &ctx("u1"),
            )
            .await
            .unwrap();
        assert!(created.success);
        let plan_id = created.data["id"].as_str().unwrap().to_string();

        let listed = list.execute(json!({}), &ctx("u1")).await.unwrap();
        assert_eq!(listed.data["total"], 1);

        let updated = update
            .execute(json!({ "plan_id": plan_id, "title": "Launch v2" }), &ctx("u1"))
            .await
            .unwrap();
        assert_eq!(updated.data["title"], "Launch v2");

        let deleted = delete
            .execute(json!({ "plan_id": plan_id }), &ctx("u1"))
            .await
            .unwrap();
        assert!(deleted.success);

        let listed = list.execute(json!({}), &ctx("u1")).await.unwrap();
        assert_eq!(listed.data["total"], 0);
    }

    #[tokio::test]
    async fn update_is_user_scoped() {
        let (_dir, tools) = tools().await;
        let (create, update) = (&tools[0], &tools[2]);
        let created = create
            .execute(
                json!({ "title": "Mine", "tasks": [{ "title": "t" }] }),
                &ctx("u1"),
            )
            .await
            .unwrap();
        let plan_id = created.data["id"].as_str().unwrap().to_string();

        let other = update
            .execute(json!({ "plan_id": plan_id, "title": "hacked" }), &ctx("u2"))
            .await
            .unwrap();
        assert!(!other.success);
    }

    #[tokio::test]
    async fn create_with_empty_tasks_fails_cleanly() {
        let (_dir, tools) = tools().await;
        let created = tools[0]
            .execute(json!({ "title": "Empty", "tasks": [] }), &ctx("u1"))
            .await
            .unwrap();
        assert!(!created.success);
    }
}
