use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::models::{
    now_ts, ClickRecord, LinkStatus, NewClickRecord, NewShortLink, NewWebhookLog, ShortLink,
    Variant, Webhook, WebhookLog,
};
use crate::storage::{DateWindow, Dimension, Scope, Storage, StorageError, StorageResult};

const LINK_COLUMNS: &str = "id, slug, original_url, owner_id, password_hash, expires_at, status, \
     click_count, is_ab_test, is_smart_routing, utm_source, utm_medium, utm_campaign, utm_term, \
     utm_content, created_at";

const CLICK_COLUMNS: &str = "id, url_id, owner_id, variant_id, routing_rule_id, ip_address, \
     browser, os, device, country, region, city, referrer_host, utm_source, utm_medium, \
     utm_campaign, is_bot, bot_name, created_at";

const WEBHOOK_COLUMNS: &str = "id, url, secret, events, is_active, total_sent, total_success, \
     total_failed, last_sent_at, last_error, created_at";

/// Bind the single scope parameter (link id or owner id) onto a query.
macro_rules! bind_scope {
    ($query:expr, $scope:expr) => {
        match $scope {
            Scope::Link(id) => $query.bind(*id),
            Scope::Owner(owner) => $query.bind(owner.clone()),
        }
    };
}

pub struct SqliteStorage {
    pool: Arc<SqlitePool>,
}

impl SqliteStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                slug TEXT NOT NULL UNIQUE,
                original_url TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                password_hash TEXT,
                expires_at INTEGER,
                status TEXT NOT NULL DEFAULT 'active',
                click_count INTEGER NOT NULL DEFAULT 0,
                is_ab_test INTEGER NOT NULL DEFAULT 0,
                is_smart_routing INTEGER NOT NULL DEFAULT 0,
                utm_source TEXT,
                utm_medium TEXT,
                utm_campaign TEXT,
                utm_term TEXT,
                utm_content TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_links_slug ON links(slug)")
            .execute(self.pool.as_ref())
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_links_owner ON links(owner_id)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS variants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url_id INTEGER NOT NULL,
                target_url TEXT NOT NULL,
                weight INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                click_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_variants_url ON variants(url_id)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS clicks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url_id INTEGER NOT NULL,
                owner_id TEXT NOT NULL,
                variant_id INTEGER,
                routing_rule_id INTEGER,
                ip_address TEXT,
                browser TEXT,
                os TEXT,
                device TEXT,
                country TEXT,
                region TEXT,
                city TEXT,
                referrer_host TEXT,
                utm_source TEXT,
                utm_medium TEXT,
                utm_campaign TEXT,
                is_bot INTEGER NOT NULL DEFAULT 0,
                bot_name TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_clicks_url_time ON clicks(url_id, created_at)")
            .execute(self.pool.as_ref())
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_clicks_owner_time ON clicks(owner_id, created_at)",
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS webhooks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL,
                secret TEXT NOT NULL,
                events TEXT NOT NULL DEFAULT '[]',
                is_active INTEGER NOT NULL DEFAULT 1,
                total_sent INTEGER NOT NULL DEFAULT 0,
                total_success INTEGER NOT NULL DEFAULT 0,
                total_failed INTEGER NOT NULL DEFAULT 0,
                last_sent_at INTEGER,
                last_error TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS webhook_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                webhook_id INTEGER NOT NULL,
                event TEXT NOT NULL,
                payload TEXT NOT NULL,
                status_code INTEGER,
                response_body TEXT,
                duration_ms INTEGER NOT NULL,
                attempt INTEGER NOT NULL,
                success INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_webhook_logs ON webhook_logs(webhook_id)")
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn create_link(&self, link: NewShortLink) -> StorageResult<ShortLink> {
        let created_at = now_ts();

        let result = sqlx::query(
            r#"
            INSERT INTO links (slug, original_url, owner_id, password_hash, expires_at,
                               utm_source, utm_medium, utm_campaign, utm_term, utm_content,
                               created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(slug) DO NOTHING
            "#,
        )
        .bind(&link.slug)
        .bind(&link.original_url)
        .bind(&link.owner_id)
        .bind(&link.password_hash)
        .bind(link.expires_at)
        .bind(&link.utm.source)
        .bind(&link.utm.medium)
        .bind(&link.utm.campaign)
        .bind(&link.utm.term)
        .bind(&link.utm.content)
        .bind(created_at)
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::Other(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict);
        }

        let row = sqlx::query_as::<_, ShortLink>(&format!(
            "SELECT {LINK_COLUMNS} FROM links WHERE slug = ?"
        ))
        .bind(&link.slug)
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::Other(e.into()))?;

        Ok(row)
    }

    async fn get_link(&self, id: i64) -> Result<Option<ShortLink>> {
        let row = sqlx::query_as::<_, ShortLink>(&format!(
            "SELECT {LINK_COLUMNS} FROM links WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(row)
    }

    async fn get_link_by_slug(&self, slug: &str) -> Result<Option<ShortLink>> {
        let row = sqlx::query_as::<_, ShortLink>(&format!(
            "SELECT {LINK_COLUMNS} FROM links WHERE slug = ?"
        ))
        .bind(slug)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(row)
    }

    async fn set_link_status(&self, id: i64, status: LinkStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE links SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_link(&self, id: i64) -> Result<bool> {
        // Cascade by hand inside one transaction so the invariant does not
        // depend on connection pragmas.
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM clicks WHERE url_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM variants WHERE url_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM links WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn increment_link_clicks(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE links SET click_count = click_count + 1 WHERE id = ?")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn create_variant(&self, url_id: i64, target_url: &str, weight: i64) -> Result<Variant> {
        if !(0..=100).contains(&weight) {
            anyhow::bail!("variant weight must be between 0 and 100, got {weight}");
        }
        let created_at = now_ts();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO variants (url_id, target_url, weight, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(url_id)
        .bind(target_url)
        .bind(weight)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();

        sqlx::query("UPDATE links SET is_ab_test = 1 WHERE id = ?")
            .bind(url_id)
            .execute(&mut *tx)
            .await?;

        let variant = sqlx::query_as::<_, Variant>(
            "SELECT id, url_id, target_url, weight, is_active, click_count, created_at \
             FROM variants WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(variant)
    }

    async fn active_variants(&self, url_id: i64) -> Result<Vec<Variant>> {
        let variants = sqlx::query_as::<_, Variant>(
            "SELECT id, url_id, target_url, weight, is_active, click_count, created_at \
             FROM variants WHERE url_id = ? AND is_active = 1 ORDER BY id ASC",
        )
        .bind(url_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(variants)
    }

    async fn delete_variant(&self, id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let url_id: Option<i64> = sqlx::query_scalar("SELECT url_id FROM variants WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(url_id) = url_id else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM variants WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let remaining: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM variants WHERE url_id = ? AND is_active = 1",
        )
        .bind(url_id)
        .fetch_one(&mut *tx)
        .await?;

        if remaining == 0 {
            sqlx::query("UPDATE links SET is_ab_test = 0 WHERE id = ?")
                .bind(url_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn increment_variant_clicks(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE variants SET click_count = click_count + 1 WHERE id = ?")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn insert_click(&self, click: NewClickRecord) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO clicks (url_id, owner_id, variant_id, routing_rule_id, ip_address,
                                browser, os, device, country, region, city, referrer_host,
                                utm_source, utm_medium, utm_campaign, is_bot, bot_name,
                                created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(click.url_id)
        .bind(&click.owner_id)
        .bind(click.variant_id)
        .bind(click.routing_rule_id)
        .bind(&click.ip_address)
        .bind(&click.browser)
        .bind(&click.os)
        .bind(&click.device)
        .bind(&click.country)
        .bind(&click.region)
        .bind(&click.city)
        .bind(&click.referrer_host)
        .bind(&click.utm_source)
        .bind(&click.utm_medium)
        .bind(&click.utm_campaign)
        .bind(click.is_bot)
        .bind(&click.bot_name)
        .bind(click.created_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn count_clicks(&self, scope: &Scope, window: &DateWindow) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM clicks WHERE {} AND created_at >= ? AND created_at < ?",
            scope_clause(scope)
        );
        let query = sqlx::query_scalar::<_, i64>(&sql);
        let count = bind_scope!(query, scope)
            .bind(window.start_ts())
            .bind(window.end_ts_exclusive())
            .fetch_one(self.pool.as_ref())
            .await?;
        Ok(count)
    }

    async fn count_distinct_ips(&self, scope: &Scope, window: &DateWindow) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(DISTINCT ip_address) FROM clicks \
             WHERE {} AND created_at >= ? AND created_at < ?",
            scope_clause(scope)
        );
        let query = sqlx::query_scalar::<_, i64>(&sql);
        let count = bind_scope!(query, scope)
            .bind(window.start_ts())
            .bind(window.end_ts_exclusive())
            .fetch_one(self.pool.as_ref())
            .await?;
        Ok(count)
    }

    async fn daily_counts(
        &self,
        scope: &Scope,
        window: &DateWindow,
    ) -> Result<Vec<(NaiveDate, i64)>> {
        let sql = format!(
            "SELECT date(created_at, 'unixepoch') AS day, COUNT(*) AS cnt FROM clicks \
             WHERE {} AND created_at >= ? AND created_at < ? \
             GROUP BY day ORDER BY day ASC",
            scope_clause(scope)
        );
        let query = sqlx::query_as::<_, (String, i64)>(&sql);
        let rows = bind_scope!(query, scope)
            .bind(window.start_ts())
            .bind(window.end_ts_exclusive())
            .fetch_all(self.pool.as_ref())
            .await?;

        rows.into_iter()
            .map(|(day, count)| {
                let date = NaiveDate::parse_from_str(&day, "%Y-%m-%d")?;
                Ok((date, count))
            })
            .collect()
    }

    async fn grouped_counts(
        &self,
        scope: &Scope,
        window: &DateWindow,
        dimension: Dimension,
        limit: i64,
    ) -> Result<Vec<(String, i64)>> {
        let sql = format!(
            "SELECT COALESCE({col}, 'Unknown') AS dim, COUNT(*) AS cnt FROM clicks \
             WHERE {scope} AND created_at >= ? AND created_at < ? \
             GROUP BY dim ORDER BY cnt DESC, dim ASC LIMIT ?",
            col = dimension.column(),
            scope = scope_clause(scope),
        );
        let query = sqlx::query_as::<_, (String, i64)>(&sql);
        let rows = bind_scope!(query, scope)
            .bind(window.start_ts())
            .bind(window.end_ts_exclusive())
            .bind(limit)
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(rows)
    }

    async fn count_bot_clicks(&self, scope: &Scope, window: &DateWindow) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM clicks \
             WHERE {} AND is_bot = 1 AND created_at >= ? AND created_at < ?",
            scope_clause(scope)
        );
        let query = sqlx::query_scalar::<_, i64>(&sql);
        let count = bind_scope!(query, scope)
            .bind(window.start_ts())
            .bind(window.end_ts_exclusive())
            .fetch_one(self.pool.as_ref())
            .await?;
        Ok(count)
    }

    async fn bot_name_counts(
        &self,
        scope: &Scope,
        window: &DateWindow,
        limit: i64,
    ) -> Result<Vec<(String, i64)>> {
        let sql = format!(
            "SELECT COALESCE(bot_name, 'Unknown') AS dim, COUNT(*) AS cnt FROM clicks \
             WHERE {} AND is_bot = 1 AND created_at >= ? AND created_at < ? \
             GROUP BY dim ORDER BY cnt DESC, dim ASC LIMIT ?",
            scope_clause(scope)
        );
        let query = sqlx::query_as::<_, (String, i64)>(&sql);
        let rows = bind_scope!(query, scope)
            .bind(window.start_ts())
            .bind(window.end_ts_exclusive())
            .bind(limit)
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(rows)
    }

    async fn variant_counts(
        &self,
        url_id: i64,
        window: &DateWindow,
    ) -> Result<Vec<(Option<i64>, i64)>> {
        let rows = sqlx::query_as::<_, (Option<i64>, i64)>(
            "SELECT variant_id, COUNT(*) AS cnt FROM clicks \
             WHERE url_id = ? AND is_bot = 0 AND created_at >= ? AND created_at < ? \
             GROUP BY variant_id ORDER BY cnt DESC, variant_id ASC",
        )
        .bind(url_id)
        .bind(window.start_ts())
        .bind(window.end_ts_exclusive())
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows)
    }

    async fn load_clicks(&self, scope: &Scope, window: &DateWindow) -> Result<Vec<ClickRecord>> {
        let sql = format!(
            "SELECT {CLICK_COLUMNS} FROM clicks \
             WHERE {} AND created_at >= ? AND created_at < ? ORDER BY id ASC",
            scope_clause(scope)
        );
        let query = sqlx::query_as::<_, ClickRecord>(&sql);
        let rows = bind_scope!(query, scope)
            .bind(window.start_ts())
            .bind(window.end_ts_exclusive())
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(rows)
    }

    async fn clicks_page(
        &self,
        scope: &Scope,
        window: &DateWindow,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<ClickRecord>> {
        let sql = format!(
            "SELECT {CLICK_COLUMNS} FROM clicks \
             WHERE {} AND created_at >= ? AND created_at < ? AND id > ? \
             ORDER BY id ASC LIMIT ?",
            scope_clause(scope)
        );
        let query = sqlx::query_as::<_, ClickRecord>(&sql);
        let rows = bind_scope!(query, scope)
            .bind(window.start_ts())
            .bind(window.end_ts_exclusive())
            .bind(after_id)
            .bind(limit)
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(rows)
    }

    async fn create_webhook(&self, url: &str, secret: &str, events: &[&str]) -> Result<Webhook> {
        let events_json = serde_json::to_string(events)?;
        let result = sqlx::query(
            "INSERT INTO webhooks (url, secret, events, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(url)
        .bind(secret)
        .bind(&events_json)
        .bind(now_ts())
        .execute(self.pool.as_ref())
        .await?;

        let webhook = sqlx::query_as::<_, Webhook>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = ?"
        ))
        .bind(result.last_insert_rowid())
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(webhook)
    }

    async fn get_webhook(&self, id: i64) -> Result<Option<Webhook>> {
        let webhook = sqlx::query_as::<_, Webhook>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(webhook)
    }

    async fn active_webhooks_for_event(&self, event: &str) -> Result<Vec<Webhook>> {
        // Subscription sets are small JSON arrays; filter in process.
        let webhooks = sqlx::query_as::<_, Webhook>(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE is_active = 1 ORDER BY id ASC"
        ))
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(webhooks
            .into_iter()
            .filter(|w| w.subscribes_to(event))
            .collect())
    }

    async fn append_webhook_log(&self, log: NewWebhookLog) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_logs (webhook_id, event, payload, status_code, response_body,
                                      duration_ms, attempt, success, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(log.webhook_id)
        .bind(&log.event)
        .bind(&log.payload)
        .bind(log.status_code)
        .bind(&log.response_body)
        .bind(log.duration_ms)
        .bind(log.attempt)
        .bind(log.success)
        .bind(now_ts())
        .execute(self.pool.as_ref())
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn webhook_logs(&self, webhook_id: i64) -> Result<Vec<WebhookLog>> {
        let logs = sqlx::query_as::<_, WebhookLog>(
            "SELECT id, webhook_id, event, payload, status_code, response_body, duration_ms, \
             attempt, success, created_at \
             FROM webhook_logs WHERE webhook_id = ? ORDER BY id ASC",
        )
        .bind(webhook_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(logs)
    }

    async fn record_delivery_outcome(
        &self,
        webhook_id: i64,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhooks SET
                total_sent = total_sent + 1,
                total_success = total_success + CASE WHEN ? THEN 1 ELSE 0 END,
                total_failed = total_failed + CASE WHEN ? THEN 0 ELSE 1 END,
                last_sent_at = ?,
                last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(success)
        .bind(success)
        .bind(now_ts())
        .bind(error)
        .bind(webhook_id)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }
}

fn scope_clause(scope: &Scope) -> &'static str {
    match scope {
        Scope::Link(_) => "url_id = ?",
        Scope::Owner(_) => "owner_id = ?",
    }
}
