//! Built-in tool plugins: web search, plan CRUD, and time utilities.

mod plan;
mod time;
mod web_search;

pub use plan::{plan_tools, PlanCreateTool, PlanDeleteTool, PlanListTool, PlanUpdateTool};
pub use time::TimeTool;
pub use web_search::WebSearchTool;

use std::sync::Arc;

use super::{ToolError, ToolRegistry};
use crate::repo::PlanRepo;

/// Registers every built-in tool. The search tool registers disabled when no
/// API key is configured, so its schema stays out of provider requests.
pub async fn register_builtin_tools(
    registry: &ToolRegistry,
    plan_repo: Arc<dyn PlanRepo>,
    tavily_api_key: Option<String>,
) -> Result<(), ToolError> {
    registry
        .register(Arc::new(WebSearchTool::new(tavily_api_key)))
        .await?;
    for tool in plan_tools(plan_repo) {
        registry.register(tool).await?;
    }
    registry.register(Arc::new(TimeTool)).await?;
    Ok(())
}
