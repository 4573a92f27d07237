use std::sync::Arc;

use async_trait::async_trait;
use themebox_db::entities::sandboxes;
use themebox_db::sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
    SqlErr, sea_query::Expr,
};
use themebox_process::{PortPair, SandboxId, SandboxStatus, UserId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sandbox not found: {0}")]
    NotFound(String),
    #[error("write conflicts with an existing row: {0}")]
    Conflict(String),
    #[error("stored sandbox row is invalid: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Db(DbErr),
}

impl From<DbErr> for StoreError {
    fn from(err: DbErr) -> Self {
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(msg)) => StoreError::Conflict(msg),
            _ => StoreError::Db(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewSandbox {
    pub id: SandboxId,
    pub user_id: UserId,
    pub store_domain: String,
    pub access_token: String,
    pub store_password: Option<String>,
    pub theme_id: i64,
}

#[derive(Debug, Clone)]
pub struct SandboxRecord {
    pub id: SandboxId,
    pub user_id: UserId,
    pub store_domain: String,
    pub access_token: String,
    pub store_password: Option<String>,
    pub theme_id: i64,
    pub status: SandboxStatus,
    pub status_message: Option<String>,
    pub ports: Option<PortPair>,
    pub pid: Option<i32>,
    pub preview_url: Option<String>,
    pub public_url: Option<String>,
    pub local_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAssignment {
    pub sandbox_id: SandboxId,
    pub ports: PortPair,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredUrls {
    pub preview_url: Option<String>,
    pub public_url: Option<String>,
    pub local_url: Option<String>,
}

/// Persistence seam for sandbox records. The port allocator only needs
/// `list_port_assignments` and `assign_ports_if_unset`; neither is assumed to
/// be transactional with the other.
#[async_trait]
pub trait SandboxStore: Send + Sync {
    async fn insert(&self, new: NewSandbox) -> Result<SandboxRecord, StoreError>;

    async fn get(&self, id: &SandboxId) -> Result<Option<SandboxRecord>, StoreError>;

    async fn list_port_assignments(&self) -> Result<Vec<PortAssignment>, StoreError>;

    /// Conditional write: assigns `ports` only if the sandbox has no pair yet.
    /// Returns `Ok(false)` when the sandbox already had one (or does not exist).
    async fn assign_ports_if_unset(&self, id: &SandboxId, ports: PortPair)
    -> Result<bool, StoreError>;

    async fn update_status(
        &self,
        id: &SandboxId,
        status: SandboxStatus,
        message: Option<String>,
    ) -> Result<(), StoreError>;

    async fn set_urls(&self, id: &SandboxId, urls: &StoredUrls) -> Result<(), StoreError>;

    async fn set_pid(&self, id: &SandboxId, pid: Option<i32>) -> Result<(), StoreError>;

    async fn delete(&self, id: &SandboxId) -> Result<bool, StoreError>;
}

#[derive(Clone)]
pub struct DbSandboxStore {
    db: Arc<DatabaseConnection>,
}

impl DbSandboxStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

fn now() -> chrono::DateTime<chrono::FixedOffset> {
    chrono::Utc::now().into()
}

fn port_from_column(id: &str, v: i32) -> Result<u16, StoreError> {
    u16::try_from(v).map_err(|_| StoreError::Corrupt(format!("{id}: port {v} out of range")))
}

fn record_from_model(m: sandboxes::Model) -> Result<SandboxRecord, StoreError> {
    let status = SandboxStatus::parse(&m.status)
        .ok_or_else(|| StoreError::Corrupt(format!("{}: unknown status {:?}", m.id, m.status)))?;
    let ports = match (m.app_port, m.proxy_port) {
        (Some(app), Some(proxy)) => Some(PortPair {
            app_port: port_from_column(&m.id, app)?,
            proxy_port: port_from_column(&m.id, proxy)?,
        }),
        (None, None) => None,
        _ => {
            return Err(StoreError::Corrupt(format!(
                "{}: only one of app_port/proxy_port is set",
                m.id
            )));
        }
    };

    Ok(SandboxRecord {
        id: SandboxId(m.id),
        user_id: UserId(m.user_id),
        store_domain: m.store_domain,
        access_token: m.access_token,
        store_password: m.store_password,
        theme_id: m.theme_id,
        status,
        status_message: m.status_message,
        ports,
        pid: m.pid,
        preview_url: m.preview_url,
        public_url: m.public_url,
        local_url: m.local_url,
    })
}

fn ensure_updated(id: &SandboxId, rows_affected: u64) -> Result<(), StoreError> {
    if rows_affected == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    Ok(())
}

#[async_trait]
impl SandboxStore for DbSandboxStore {
    async fn insert(&self, new: NewSandbox) -> Result<SandboxRecord, StoreError> {
        let model = sandboxes::ActiveModel {
            id: Set(new.id.0),
            user_id: Set(new.user_id.0),
            store_domain: Set(new.store_domain),
            access_token: Set(new.access_token),
            store_password: Set(new.store_password),
            theme_id: Set(new.theme_id),
            status: Set(SandboxStatus::Created.as_str().to_string()),
            status_message: Set(None),
            app_port: Set(None),
            proxy_port: Set(None),
            pid: Set(None),
            preview_url: Set(None),
            public_url: Set(None),
            local_url: Set(None),
            created_at: Set(now()),
            updated_at: Set(now()),
        }
        .insert(&*self.db)
        .await?;
        record_from_model(model)
    }

    async fn get(&self, id: &SandboxId) -> Result<Option<SandboxRecord>, StoreError> {
        sandboxes::Entity::find_by_id(id.0.clone())
            .one(&*self.db)
            .await?
            .map(record_from_model)
            .transpose()
    }

    async fn list_port_assignments(&self) -> Result<Vec<PortAssignment>, StoreError> {
        let rows = sandboxes::Entity::find()
            .filter(sandboxes::Column::AppPort.is_not_null())
            .filter(sandboxes::Column::ProxyPort.is_not_null())
            .all(&*self.db)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let (Some(app), Some(proxy)) = (row.app_port, row.proxy_port) else {
                continue;
            };
            out.push(PortAssignment {
                sandbox_id: SandboxId(row.id.clone()),
                ports: PortPair {
                    app_port: port_from_column(&row.id, app)?,
                    proxy_port: port_from_column(&row.id, proxy)?,
                },
            });
        }
        Ok(out)
    }

    async fn assign_ports_if_unset(
        &self,
        id: &SandboxId,
        ports: PortPair,
    ) -> Result<bool, StoreError> {
        let res = sandboxes::Entity::update_many()
            .col_expr(
                sandboxes::Column::AppPort,
                Expr::value(i32::from(ports.app_port)),
            )
            .col_expr(
                sandboxes::Column::ProxyPort,
                Expr::value(i32::from(ports.proxy_port)),
            )
            .col_expr(sandboxes::Column::UpdatedAt, Expr::value(now()))
            .filter(sandboxes::Column::Id.eq(id.as_str()))
            .filter(sandboxes::Column::AppPort.is_null())
            .filter(sandboxes::Column::ProxyPort.is_null())
            .exec(&*self.db)
            .await?;
        Ok(res.rows_affected == 1)
    }

    async fn update_status(
        &self,
        id: &SandboxId,
        status: SandboxStatus,
        message: Option<String>,
    ) -> Result<(), StoreError> {
        let res = sandboxes::Entity::update_many()
            .col_expr(sandboxes::Column::Status, Expr::value(status.as_str()))
            .col_expr(sandboxes::Column::StatusMessage, Expr::value(message))
            .col_expr(sandboxes::Column::UpdatedAt, Expr::value(now()))
            .filter(sandboxes::Column::Id.eq(id.as_str()))
            .exec(&*self.db)
            .await?;
        ensure_updated(id, res.rows_affected)
    }

    async fn set_urls(&self, id: &SandboxId, urls: &StoredUrls) -> Result<(), StoreError> {
        let res = sandboxes::Entity::update_many()
            .col_expr(
                sandboxes::Column::PreviewUrl,
                Expr::value(urls.preview_url.clone()),
            )
            .col_expr(
                sandboxes::Column::PublicUrl,
                Expr::value(urls.public_url.clone()),
            )
            .col_expr(
                sandboxes::Column::LocalUrl,
                Expr::value(urls.local_url.clone()),
            )
            .col_expr(sandboxes::Column::UpdatedAt, Expr::value(now()))
            .filter(sandboxes::Column::Id.eq(id.as_str()))
            .exec(&*self.db)
            .await?;
        ensure_updated(id, res.rows_affected)
    }

    async fn set_pid(&self, id: &SandboxId, pid: Option<i32>) -> Result<(), StoreError> {
        let res = sandboxes::Entity::update_many()
            .col_expr(sandboxes::Column::Pid, Expr::value(pid))
            .col_expr(sandboxes::Column::UpdatedAt, Expr::value(now()))
            .filter(sandboxes::Column::Id.eq(id.as_str()))
            .exec(&*self.db)
            .await?;
        ensure_updated(id, res.rows_affected)
    }

    async fn delete(&self, id: &SandboxId) -> Result<bool, StoreError> {
        let res = sandboxes::Entity::delete_by_id(id.0.clone())
            .exec(&*self.db)
            .await?;
        Ok(res.rows_affected > 0)
    }
}
