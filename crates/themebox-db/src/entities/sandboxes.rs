use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sandboxes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub user_id: String,
    pub store_domain: String,
    pub access_token: String,
    pub store_password: Option<String>,
    pub theme_id: i64,
    pub status: String,
    pub status_message: Option<String>,
    // Both set or both null; unique across the table.
    pub app_port: Option<i32>,
    pub proxy_port: Option<i32>,
    pub pid: Option<i32>,
    pub preview_url: Option<String>,
    pub public_url: Option<String>,
    pub local_url: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
