use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Sandboxes::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Sandboxes::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Sandboxes::UserId).string().not_null())
                    .col(ColumnDef::new(Sandboxes::StoreDomain).string().not_null())
                    .col(ColumnDef::new(Sandboxes::AccessToken).string().not_null())
                    .col(ColumnDef::new(Sandboxes::StorePassword).string().null())
                    .col(ColumnDef::new(Sandboxes::ThemeId).big_integer().not_null())
                    .col(ColumnDef::new(Sandboxes::Status).string().not_null())
                    .col(ColumnDef::new(Sandboxes::StatusMessage).text().null())
                    .col(ColumnDef::new(Sandboxes::AppPort).integer().null())
                    .col(ColumnDef::new(Sandboxes::ProxyPort).integer().null())
                    .col(ColumnDef::new(Sandboxes::PreviewUrl).string().null())
                    .col(ColumnDef::new(Sandboxes::PublicUrl).string().null())
                    .col(ColumnDef::new(Sandboxes::LocalUrl).string().null())
                    .col(
                        ColumnDef::new(Sandboxes::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Sandboxes::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // The unique port indexes are the cross-process guard for the
        // allocator's scan-then-assign: a racing writer fails with a
        // constraint violation instead of sharing a slot. NULLs never collide.
        manager
            .create_index(
                Index::create()
                    .name("idx_sandboxes_app_port_unique")
                    .table(Sandboxes::Table)
                    .col(Sandboxes::AppPort)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sandboxes_proxy_port_unique")
                    .table(Sandboxes::Table)
                    .col(Sandboxes::ProxyPort)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sandboxes_user_id")
                    .table(Sandboxes::Table)
                    .col(Sandboxes::UserId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for name in [
            "idx_sandboxes_user_id",
            "idx_sandboxes_proxy_port_unique",
            "idx_sandboxes_app_port_unique",
        ] {
            manager
                .drop_index(Index::drop().name(name).table(Sandboxes::Table).to_owned())
                .await?;
        }

        manager
            .drop_table(Table::drop().table(Sandboxes::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Sandboxes {
    Table,
    Id,
    UserId,
    StoreDomain,
    AccessToken,
    StorePassword,
    ThemeId,
    Status,
    StatusMessage,
    AppPort,
    ProxyPort,
    PreviewUrl,
    PublicUrl,
    LocalUrl,
    CreatedAt,
    UpdatedAt,
}
