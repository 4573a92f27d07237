use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Process group of the detached dev launcher, so teardown can signal
        // it directly instead of relying only on kill-by-port.
        manager
            .alter_table(
                Table::alter()
                    .table(Sandboxes::Table)
                    .add_column(ColumnDef::new(Sandboxes::Pid).integer().null())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .alter_table(
                Table::alter()
                    .table(Sandboxes::Table)
                    .drop_column(Sandboxes::Pid)
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum Sandboxes {
    Table,
    Pid,
}
