use sea_orm_migration::prelude::*;

#[derive(DeriveIden)]
enum Payments {
    Table,
    Version,
}

#[derive(DeriveIden)]
enum UserSubscriptions {
    Table,
    Version,
}

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Optimistic-lock counters for rows that webhooks and API handlers
        // may touch concurrently.
        manager
            .alter_table(
                Table::alter()
                    .table(Payments::Table)
                    .add_column(
                        ColumnDef::new(Payments::Version)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .alter_table(
                Table::alter()
                    .table(UserSubscriptions::Table)
                    .add_column(
                        ColumnDef::new(UserSubscriptions::Version)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .alter_table(
                Table::alter()
                    .table(Payments::Table)
                    .drop_column(Payments::Version)
                    .to_owned(),
            )
            .await?;

        manager
            .alter_table(
                Table::alter()
                    .table(UserSubscriptions::Table)
                    .drop_column(UserSubscriptions::Version)
                    .to_owned(),
            )
            .await
    }
}
