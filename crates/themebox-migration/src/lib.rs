use sea_orm_migration::prelude::*;

mod m0001_create_sandboxes;
mod m0002_add_sandbox_pid;

pub use sea_orm_migration::MigratorTrait;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m0001_create_sandboxes::Migration),
            Box::new(m0002_add_sandbox_pid::Migration),
        ]
    }
}
