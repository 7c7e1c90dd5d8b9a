//! Control plane operations against the local PostgreSQL node.
use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use sqlx::Row;

use tributary_context::Context;

use crate::config::PgLogicalConf;
use crate::conflict::ConflictRecord;
use crate::conflict::ConflictType;
use crate::error::ExtensionMissing;
use crate::types::SlotInfo;
use crate::types::SubscriptionProgress;
use crate::types::SubscriptionStatus;

/// Control plane operations against the local PostgreSQL node.
///
/// All pglogical management functions run through here; the controller
/// owns its connection pool and is shared by the monitor loops.
pub struct ReplicationController {
    conf: PgLogicalConf,
    pool: PgPool,
}

impl ReplicationController {
    /// Open the pool to the local database.
    pub async fn connect(conf: PgLogicalConf) -> Result<ReplicationController> {
        let pool = PgPoolOptions::new()
            .max_connections(conf.pool_size)
            .connect(&conf.dsn)
            .await?;
        Ok(ReplicationController { conf, pool })
    }

    /// Check the extension is installed and the GUCs support replication.
    ///
    /// A missing extension is fatal; GUC mismatches are logged so the
    /// operator can fix the server configuration.
    pub async fn verify_prerequisites(&self, context: &Context) -> Result<()> {
        let installed: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM pg_extension WHERE extname = 'pglogical')",
        )
        .fetch_one(&self.pool)
        .await?;
        if !installed {
            anyhow::bail!(ExtensionMissing::new(&self.conf.name));
        }

        let wal_level: String = sqlx::query_scalar("SHOW wal_level")
            .fetch_one(&self.pool)
            .await?;
        if wal_level != "logical" {
            slog::warn!(
                context.logger, "wal_level does not support logical replication";
                "wal_level" => wal_level,
            );
        }
        let max_slots: String = sqlx::query_scalar("SHOW max_replication_slots")
            .fetch_one(&self.pool)
            .await?;
        let max_slots: u32 = max_slots.parse().unwrap_or(0);
        if max_slots < self.conf.max_replication_slots {
            slog::warn!(
                context.logger, "max_replication_slots may be too low";
                "configured" => max_slots, "expected" => self.conf.max_replication_slots,
            );
        }
        Ok(())
    }

    /// Create the local node if it does not already exist.
    pub async fn ensure_node(&self, context: &Context) -> Result<()> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM pglogical.node WHERE node_name = $1)",
        )
        .bind(&self.conf.node_name)
        .fetch_one(&self.pool)
        .await?;
        if exists {
            slog::debug!(
                context.logger, "Local node already exists";
                "node" => &self.conf.node_name,
            );
            return Ok(());
        }
        sqlx::query("SELECT pglogical.create_node(node_name := $1, dsn := $2)")
            .bind(&self.conf.node_name)
            .bind(&self.conf.dsn)
            .execute(&self.pool)
            .await?;
        slog::info!(
            context.logger, "Created local node";
            "node" => &self.conf.node_name,
        );
        Ok(())
    }

    /// Create the configured replication sets if missing.
    pub async fn ensure_replication_sets(&self, context: &Context) -> Result<()> {
        for set in &self.conf.replication_sets {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM pglogical.replication_set WHERE set_name = $1)",
            )
            .bind(set)
            .fetch_one(&self.pool)
            .await?;
            if exists {
                continue;
            }
            sqlx::query("SELECT pglogical.create_replication_set($1, $2, $3, $4, $5)")
                .bind(set)
                .bind(self.conf.replicate_insert)
                .bind(self.conf.replicate_update)
                .bind(self.conf.replicate_delete)
                .bind(self.conf.replicate_truncate)
                .execute(&self.pool)
                .await?;
            slog::info!(context.logger, "Created replication set"; "set" => set);
        }
        Ok(())
    }

    /// Add the configured tables to every replication set.
    ///
    /// Per-table failures (already a member, missing table) are logged and
    /// do not abort the rest of the setup.
    pub async fn add_tables(&self, context: &Context) -> Result<()> {
        for table in &self.conf.tables {
            for set in &self.conf.replication_sets {
                let added = sqlx::query("SELECT pglogical.replication_set_add_table($1, $2, $3)")
                    .bind(set)
                    .bind(table)
                    .bind(self.conf.synchronize_data)
                    .execute(&self.pool)
                    .await;
                match added {
                    Ok(_) => slog::info!(
                        context.logger, "Added table to replication set";
                        "table" => table, "set" => set,
                    ),
                    Err(error) => slog::warn!(
                        context.logger, "Failed to add table to replication set";
                        "table" => table, "set" => set, "error" => %error,
                    ),
                }
            }
        }
        Ok(())
    }

    /// Create the subscription to the provider if missing.
    pub async fn ensure_subscription(&self, context: &Context, provider_dsn: &str) -> Result<()> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM pglogical.subscription WHERE sub_name = $1)",
        )
        .bind(&self.conf.subscription_name)
        .fetch_one(&self.pool)
        .await?;
        if exists {
            slog::debug!(
                context.logger, "Subscription already exists";
                "subscription" => &self.conf.subscription_name,
            );
            return Ok(());
        }
        sqlx::query(
            r#"
            SELECT pglogical.create_subscription(
                subscription_name := $1,
                provider_dsn := $2,
                replication_sets := $3,
                synchronize_structure := false,
                synchronize_data := $4
            )
            "#,
        )
        .bind(&self.conf.subscription_name)
        .bind(provider_dsn)
        .bind(&self.conf.replication_sets)
        .bind(self.conf.synchronize_data)
        .execute(&self.pool)
        .await?;
        slog::info!(
            context.logger, "Created subscription";
            "subscription" => &self.conf.subscription_name,
        );
        Ok(())
    }

    /// Declare the conflict policy on the replicated tables.
    pub async fn configure_conflict_handling(&self, context: &Context) -> Result<()> {
        for table in &self.conf.tables {
            let statement = format!(
                "ALTER TABLE {} SET (pglogical.conflict_resolution = '{}')",
                table,
                self.conf.conflict_policy.as_str(),
            );
            if let Err(error) = sqlx::query(&statement).execute(&self.pool).await {
                slog::warn!(
                    context.logger, "Failed to set conflict resolution on table";
                    "table" => table, "error" => %error,
                );
                continue;
            }
            if self.conf.conflict_logging {
                let statement = format!("ALTER TABLE {} SET (pglogical.conflict_log = true)", table);
                if let Err(error) = sqlx::query(&statement).execute(&self.pool).await {
                    slog::warn!(
                        context.logger, "Failed to enable conflict logging on table";
                        "table" => table, "error" => %error,
                    );
                }
            }
        }
        Ok(())
    }

    /// Status of the owned subscription, when it exists.
    pub async fn subscription_status(&self) -> Result<Option<SubscriptionStatus>> {
        let row = sqlx::query(
            r#"
            SELECT subscription_name, status, provider_node, slot_name, replication_sets
            FROM pglogical.show_subscription_status()
            WHERE subscription_name = $1
            "#,
        )
        .bind(&self.conf.subscription_name)
        .fetch_optional(&self.pool)
        .await?;
        let status = row
            .map(|row| -> Result<SubscriptionStatus> {
                Ok(SubscriptionStatus {
                    subscription_name: row.try_get("subscription_name")?,
                    status: row.try_get("status")?,
                    provider_node: row.try_get("provider_node")?,
                    slot_name: row.try_get("slot_name")?,
                    replication_sets: row.try_get("replication_sets")?,
                })
            })
            .transpose()?;
        Ok(status)
    }

    /// Replication slots owned by the pglogical plugin.
    pub async fn slots(&self) -> Result<Vec<SlotInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT slot_name, plugin, active,
                   restart_lsn::text AS restart_lsn,
                   confirmed_flush_lsn::text AS confirmed_flush_lsn
            FROM pg_replication_slots
            WHERE plugin = 'pglogical_output'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut slots = Vec::with_capacity(rows.len());
        for row in rows {
            slots.push(SlotInfo {
                slot_name: row.try_get("slot_name")?,
                plugin: row.try_get("plugin")?,
                active: row.try_get("active")?,
                restart_lsn: row.try_get("restart_lsn")?,
                confirmed_flush_lsn: row.try_get("confirmed_flush_lsn")?,
            });
        }
        Ok(slots)
    }

    /// Apply progress of the owned subscription.
    pub async fn subscription_progress(&self) -> Result<SubscriptionProgress> {
        let row = sqlx::query(
            r#"
            SELECT received_lsn::text AS received_lsn,
                   latest_end_lsn::text AS latest_end_lsn,
                   last_msg_receipt_time
            FROM pg_stat_subscription
            WHERE subname = $1
            "#,
        )
        .bind(&self.conf.subscription_name)
        .fetch_optional(&self.pool)
        .await?;
        let progress = match row {
            None => SubscriptionProgress::default(),
            Some(row) => SubscriptionProgress {
                received_lsn: row.try_get("received_lsn")?,
                latest_end_lsn: row.try_get("latest_end_lsn")?,
                last_msg_receipt_time: row.try_get("last_msg_receipt_time")?,
            },
        };
        Ok(progress)
    }

    /// Wall clock apply lag in milliseconds, when replaying.
    pub async fn apply_lag_ms(&self) -> Result<Option<f64>> {
        let lag: Option<f64> = sqlx::query_scalar(
            "SELECT EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp())) * 1000",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(lag)
    }

    /// Unresolved conflicts from the engine's conflict log, newest first.
    pub async fn unresolved_conflicts(&self, limit: i64) -> Result<Vec<ConflictRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT conflict_id, table_name, conflict_type,
                   local_tuple::text AS local_tuple,
                   remote_tuple::text AS remote_tuple,
                   conflict_time
            FROM pglogical.conflict_log
            WHERE resolved IS NULL
            ORDER BY conflict_time DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let mut conflicts = Vec::with_capacity(rows.len());
        for row in rows {
            let conflict_id: i64 = row.try_get("conflict_id")?;
            let conflict_type: String = row.try_get("conflict_type")?;
            let local_tuple: Option<String> = row.try_get("local_tuple")?;
            let remote_tuple: Option<String> = row.try_get("remote_tuple")?;
            conflicts.push(ConflictRecord {
                id: conflict_id.to_string(),
                table: row.try_get("table_name")?,
                conflict_type: ConflictType::parse(&conflict_type),
                local_tuple: local_tuple
                    .map(|raw| serde_json::from_str(&raw))
                    .transpose()?,
                remote_tuple: remote_tuple
                    .map(|raw| serde_json::from_str(&raw))
                    .transpose()?,
                resolution: None,
                resolved_at: None,
                created_at: row.try_get("conflict_time")?,
            });
        }
        Ok(conflicts)
    }

    /// Record a resolution in the engine's conflict log.
    pub async fn mark_conflict_resolved(&self, conflict_id: &str, resolution: &str) -> Result<()> {
        let conflict_id: i64 = conflict_id.parse()?;
        sqlx::query("UPDATE pglogical.conflict_log SET resolved = $1 WHERE conflict_id = $2")
            .bind(resolution)
            .bind(conflict_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
