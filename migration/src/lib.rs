pub use sea_orm_migration::prelude::*;

mod m20250512_000001_initial;
mod m20250607_000001_add_webhook_events;
mod m20250621_000001_add_version_columns;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250512_000001_initial::Migration),
            Box::new(m20250607_000001_add_webhook_events::Migration),
            Box::new(m20250621_000001_add_version_columns::Migration),
        ]
    }
}
