//! SurrealDB backend.
//!
//! Rows are keyed by their record id (`execution:<item id>`). Reads project the
//! key back out as `key` and swap it in for the domain `id` field, so no record
//! id type ever reaches the domain model.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use relay_core::api::ChangeKind;
use relay_core::model::{
    Destination, ExecutionStatus, Heartbeat, Schedule, StatusPatch, WorkItem,
};
use relay_core::task::TaskRecord;
use relay_core::EpochMs;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use surrealdb::engine::any::Any;
use surrealdb::{Action, Notification, Surreal};
use tracing::debug;

use super::{ChangeEvent, ChangeStream, Gateway, ItemFilter};
use crate::config::BackendConfig;

const SCHEMA: &str = r#"
    DEFINE TABLE IF NOT EXISTS execution SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS execution_status ON execution FIELDS status, destination_id;
    DEFINE TABLE IF NOT EXISTS task SCHEMALESS;
    DEFINE TABLE IF NOT EXISTS schedule SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS schedule_due ON schedule FIELDS enabled, next_run_at;
    DEFINE TABLE IF NOT EXISTS destination SCHEMALESS;
    DEFINE TABLE IF NOT EXISTS heartbeat SCHEMALESS;
"#;

const UNOWNED: &str = "(destination_id = NONE OR destination_id = NULL)";
const UNFENCED: &str = "(claimed_at = NONE OR claimed_at = NULL)";

#[derive(Clone)]
pub struct SurrealGateway {
    db: Surreal<Any>,
}

impl SurrealGateway {
    /// Connect to `endpoint` (any engine the SDK understands) and bootstrap tables.
    pub async fn connect(config: &BackendConfig) -> Result<Self> {
        if let Some(dir) = config.endpoint.strip_prefix("surrealkv://") {
            std::fs::create_dir_all(dir).with_context(|| format!("creating db dir {dir}"))?;
        }
        let db = surrealdb::engine::any::connect(config.endpoint.as_str())
            .await
            .with_context(|| format!("connecting to {}", config.endpoint))?;
        db.use_ns(config.namespace.as_str())
            .use_db(config.database.as_str())
            .await
            .context("selecting surreal namespace/db")?;
        db.query(SCHEMA).await.context("applying schema")?.check()?;
        Ok(Self { db })
    }

    async fn select_items(&self, predicate: String, destination_id: Option<String>, limit: usize) -> Result<Vec<WorkItem>> {
        let q = format!(
            "SELECT *, meta::id(id) AS key FROM execution WHERE {predicate} ORDER BY queued_at ASC LIMIT $limit;"
        );
        let mut resp = self
            .db
            .query(q)
            .bind(("dest", destination_id))
            .bind(("limit", limit as i64))
            .await?;
        let rows: Vec<Value> = resp.take(0)?;
        rows.into_iter().map(from_row).collect()
    }
}

fn predicate(filter: &ItemFilter) -> (String, Option<String>) {
    match filter {
        ItemFilter::AssignedUnclaimed { destination_id } => (
            format!("status = 'pending' AND destination_id = $dest AND {UNFENCED}"),
            Some(destination_id.clone()),
        ),
        ItemFilter::UnassignedPending => (format!("status = 'pending' AND {UNOWNED}"), None),
        ItemFilter::Candidates { destination_id } => (
            format!(
                "status = 'pending' AND ({UNOWNED} OR (destination_id = $dest AND {UNFENCED}))"
            ),
            Some(destination_id.clone()),
        ),
    }
}

/// Serialize a domain row as record content: everything but `id`.
fn to_content<T: Serialize>(row: &T) -> Result<Value> {
    let mut value = serde_json::to_value(row)?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("id");
    }
    Ok(value)
}

/// Rebuild a domain row from a projected record (`key` holds the plain id).
/// Rows without the projection fall back to the record id itself.
fn from_row<T: DeserializeOwned>(mut row: Value) -> Result<T> {
    let obj = row
        .as_object_mut()
        .ok_or_else(|| anyhow!("expected an object row"))?;
    let key = match obj.remove("key") {
        Some(key) => key,
        None => obj
            .get("id")
            .and_then(record_key)
            .map(Value::String)
            .ok_or_else(|| anyhow!("row is missing its key"))?,
    };
    obj.insert("id".to_string(), key);
    Ok(serde_json::from_value(row)?)
}

/// Plain key of a record id, either `table:key` text or `{tb, id}` form.
fn record_key(id: &Value) -> Option<String> {
    match id {
        Value::String(text) => {
            let key = text.split_once(':').map_or(text.as_str(), |(_, key)| key);
            Some(key.trim_start_matches('⟨').trim_end_matches('⟩').to_string())
        }
        Value::Object(thing) => match thing.get("id")? {
            Value::String(key) => Some(key.clone()),
            Value::Object(inner) => inner.get("String")?.as_str().map(str::to_string),
            _ => None,
        },
        _ => None,
    }
}

#[async_trait]
impl Gateway for SurrealGateway {
    async fn claim(
        &self,
        item_id: &str,
        destination_id: &str,
        claimed_at: EpochMs,
    ) -> Result<Option<WorkItem>> {
        let q = format!(
            r#"
            UPDATE type::thing('execution', $id)
            SET destination_id = $dest,
                claimed_at = $now,
                status = 'claimed'
            WHERE status = 'pending'
              AND ({UNOWNED} OR (destination_id = $dest AND {UNFENCED}))
            RETURN AFTER;
        "#
        );
        let mut resp = self
            .db
            .query(q)
            .bind(("id", item_id.to_string()))
            .bind(("dest", destination_id.to_string()))
            .bind(("now", claimed_at))
            .await?;
        let updated: Vec<Value> = resp.take(0)?;
        if updated.is_empty() {
            return Ok(None);
        }
        self.get_item(item_id).await
    }

    async fn query_items(&self, filter: &ItemFilter, limit: usize) -> Result<Vec<WorkItem>> {
        let (predicate, dest) = predicate(filter);
        self.select_items(predicate, dest, limit).await
    }

    async fn subscribe(&self, filter: &ItemFilter) -> Result<ChangeStream> {
        let mut resp = self
            .db
            .query("LIVE SELECT *, meta::id(id) AS key FROM execution;")
            .await
            .context("opening live query")?;
        let notifications = resp.stream::<Notification<Value>>(0)?;
        let filter = filter.clone();

        let stream = notifications.filter_map(move |n| {
            let filter = filter.clone();
            async move {
                let n = match n {
                    Ok(n) => n,
                    Err(e) => return Some(Err(anyhow::Error::from(e))),
                };
                let kind = match n.action {
                    Action::Create => ChangeKind::Created,
                    Action::Update => ChangeKind::Updated,
                    _ => return None,
                };
                match from_row::<WorkItem>(n.data) {
                    Ok(item) if filter.matches(&item) => Some(Ok(ChangeEvent { kind, item })),
                    Ok(_) => None,
                    Err(e) => {
                        debug!(error = %e, "skipping undecodable change notification");
                        None
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn get_item(&self, item_id: &str) -> Result<Option<WorkItem>> {
        let mut resp = self
            .db
            .query("SELECT *, meta::id(id) AS key FROM type::thing('execution', $id);")
            .bind(("id", item_id.to_string()))
            .await?;
        let rows: Vec<Value> = resp.take(0)?;
        rows.into_iter().next().map(from_row).transpose()
    }

    async fn update_item(
        &self,
        item_id: &str,
        status: ExecutionStatus,
        patch: &StatusPatch,
    ) -> Result<()> {
        let mut data = serde_json::to_value(patch)?;
        if let Some(obj) = data.as_object_mut() {
            obj.insert("status".to_string(), Value::from(status.as_str()));
        }
        let from: Vec<&'static str> = ExecutionStatus::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(status))
            .map(ExecutionStatus::as_str)
            .collect();
        let mut resp = self
            .db
            .query(
                "UPDATE type::thing('execution', $id) MERGE $data \
                 WHERE status IN $from RETURN AFTER;",
            )
            .bind(("id", item_id.to_string()))
            .bind(("data", data))
            .bind(("from", from))
            .await?;
        let updated: Vec<Value> = resp.take(0)?;
        if updated.is_empty() {
            return Err(anyhow!(
                "work item {item_id} not found or cannot move to {}",
                status.as_str()
            ));
        }
        Ok(())
    }

    async fn insert_item(&self, item: &WorkItem) -> Result<()> {
        self.db
            .query("CREATE type::thing('execution', $id) CONTENT $row RETURN NONE;")
            .bind(("id", item.id.clone()))
            .bind(("row", to_content(item)?))
            .await?
            .check()?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let mut resp = self
            .db
            .query("SELECT *, meta::id(id) AS key FROM type::thing('task', $id);")
            .bind(("id", task_id.to_string()))
            .await?;
        let rows: Vec<Value> = resp.take(0)?;
        rows.into_iter().next().map(from_row).transpose()
    }

    async fn due_schedules(&self, now: EpochMs, limit: usize) -> Result<Vec<Schedule>> {
        let mut resp = self
            .db
            .query(
                "SELECT *, meta::id(id) AS key FROM schedule \
                 WHERE enabled = true AND next_run_at <= $now \
                 ORDER BY next_run_at ASC LIMIT $limit;",
            )
            .bind(("now", now))
            .bind(("limit", limit as i64))
            .await?;
        let rows: Vec<Value> = resp.take(0)?;
        rows.into_iter().map(from_row).collect()
    }

    async fn advance_schedule(
        &self,
        schedule_id: &str,
        expected_next_run_at: EpochMs,
        next_run_at: EpochMs,
        enabled: bool,
        last_run_at: EpochMs,
    ) -> Result<bool> {
        let q = r#"
            UPDATE type::thing('schedule', $id)
            SET next_run_at = $next,
                enabled = $enabled,
                last_run_at = $last
            WHERE enabled = true AND next_run_at = $expected
            RETURN AFTER;
        "#;
        let mut resp = self
            .db
            .query(q)
            .bind(("id", schedule_id.to_string()))
            .bind(("next", next_run_at))
            .bind(("enabled", enabled))
            .bind(("last", last_run_at))
            .bind(("expected", expected_next_run_at))
            .await?;
        let updated: Vec<Value> = resp.take(0)?;
        Ok(!updated.is_empty())
    }

    async fn upsert_destination(&self, destination: &Destination) -> Result<()> {
        self.db
            .query("UPSERT type::thing('destination', $id) CONTENT $row RETURN NONE;")
            .bind(("id", destination.id.clone()))
            .bind(("row", to_content(destination)?))
            .await?
            .check()?;
        Ok(())
    }

    async fn insert_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        self.db
            .query("CREATE type::thing('heartbeat', $id) CONTENT $row RETURN NONE;")
            .bind(("id", heartbeat.id.clone()))
            .bind(("row", to_content(heartbeat)?))
            .await?
            .check()?;
        Ok(())
    }
}
