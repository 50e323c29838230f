use anyhow::Context;
use clap::Args;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use classroom_gradebook::gateway::RequestContext;

/// Connection and identity settings shared by every database command.
#[derive(Debug, Clone, Args)]
pub struct AppConfig {
    /// Postgres connection string of the hosted backend
    #[arg(long, env = "DATABASE_URL", hide_env_values = true, global = true)]
    pub database_url: Option<String>,

    /// Identity of the teacher or admin issuing requests
    #[arg(long, env = "GRADEBOOK_USER_ID", global = true)]
    pub user_id: Option<Uuid>,

    #[arg(long, env = "GRADEBOOK_ROLE", default_value = "teacher", global = true)]
    pub role: String,

    #[arg(long, default_value_t = 5, global = true)]
    pub max_connections: u32,
}

impl AppConfig {
    pub async fn connect(&self) -> anyhow::Result<PgPool> {
        let database_url = self
            .database_url
            .as_deref()
            .context("DATABASE_URL must be set to the backend's Postgres instance")?;
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")
    }

    pub fn request_context(&self) -> anyhow::Result<RequestContext> {
        let user_id = self
            .user_id
            .context("GRADEBOOK_USER_ID must identify the grading teacher")?;
        Ok(RequestContext::new(user_id, self.role.clone()))
    }
}
