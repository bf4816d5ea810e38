// dbshuttle/src/mysql/lifecycle.rs
use sqlx::MySqlPool;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};

use crate::config::ConnectionParams;
use crate::errors::{AppError, Result};

fn admin_connect_options(params: &ConnectionParams) -> MySqlConnectOptions {
    let mut options = MySqlConnectOptions::new()
        .host(&params.host)
        .port(params.port)
        .username(&params.user);
    if let Some(password) = &params.password {
        options = options.password(password);
    }
    options
}

/// Opens an administrative connection with no database selected, used only
/// for the existence check and creation ahead of a restore.
pub async fn admin_pool(params: &ConnectionParams) -> Result<MySqlPool> {
    let pool = MySqlPoolOptions::new()
        .max_connections(1)
        .connect_with(admin_connect_options(params))
        .await?;
    Ok(pool)
}

pub async fn database_exists(pool: &MySqlPool, name: &str) -> Result<bool> {
    let found: Option<String> = sqlx::query_scalar(
        "SELECT SCHEMA_NAME FROM information_schema.SCHEMATA WHERE SCHEMA_NAME = ?",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

/// Quotes an identifier for interpolation into DDL.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// A restore target and what is currently known about its existence.
/// Only this module updates `exists`, and only off its own probes.
#[derive(Debug, Clone)]
pub struct DatabaseTarget {
    pub name: String,
    pub exists: bool,
}

/// Makes sure the restore target exists before any byte is moved.
///
/// The post-creation re-check is what determines success: a concurrent
/// creator winning the race is indistinguishable from our own creation
/// succeeding, and that is fine. Only a target that is still absent after
/// the attempt fails the run.
pub async fn ensure_database(
    pool: &MySqlPool,
    name: &str,
    create_if_missing: bool,
) -> Result<DatabaseTarget> {
    let mut target = DatabaseTarget {
        name: name.to_string(),
        exists: database_exists(pool, name).await?,
    };
    if target.exists {
        println!("✓ Target database '{}' exists.", name);
        return Ok(target);
    }
    if !create_if_missing {
        eprintln!(
            "❌ Target database '{}' does not exist and creation is disabled.",
            name
        );
        return Err(AppError::DatabaseCreation {
            name: target.name,
        });
    }

    println!("Creating target database '{}'...", name);
    let create_sql = format!("CREATE DATABASE IF NOT EXISTS {}", quote_identifier(name));
    if let Err(e) = sqlx::query(&create_sql).execute(pool).await {
        // Not authoritative; the re-check below decides.
        eprintln!("⚠️ CREATE DATABASE for '{}' reported: {}", name, e);
    }

    target.exists = database_exists(pool, name).await?;
    if target.exists {
        println!("✓ Target database '{}' created.", name);
        Ok(target)
    } else {
        Err(AppError::DatabaseCreation {
            name: target.name,
        })
    }
}
