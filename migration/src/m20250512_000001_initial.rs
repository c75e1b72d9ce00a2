use sea_orm_migration::prelude::*;

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
    Email,
    Name,
    PasswordHash,
    Role,
    StripeCustomerId,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Courses {
    Table,
    Id,
    Title,
    Description,
    Price,
    Currency,
    IsPublished,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Enrollments {
    Table,
    Id,
    UserId,
    CourseId,
    Status,
    PaymentTransactionId,
    EnrolledAt,
    CompletedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum SubscriptionPlans {
    Table,
    Id,
    Name,
    Description,
    StripePriceId,
    PaypalPlanId,
    Price,
    Currency,
    Interval,
    IntervalCount,
    TrialPeriodDays,
    IsActive,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Payments {
    Table,
    Id,
    UserId,
    CourseId,
    EnrollmentId,
    SubscriptionId,
    Amount,
    AmountInSmallestUnit,
    Currency,
    PaymentGateway,
    TransactionId,
    Status,
    GatewayStatus,
    GatewayResponse,
    CaptureId,
    ApprovalLink,
    RenewalReason,
    TotalRefundedInSmallestUnit,
    RefundAttempts,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum UserSubscriptions {
    Table,
    Id,
    UserId,
    PlanId,
    Gateway,
    StripeSubscriptionId,
    PaypalSubscriptionId,
    GatewayCustomerId,
    GatewayPriceOrPlanId,
    Status,
    CurrentPeriodStart,
    CurrentPeriodEnd,
    TrialStart,
    TrialEnd,
    CancelAtPeriodEnd,
    CanceledAt,
    EndedAt,
    LastGatewayStatus,
    LastWebhookSyncAt,
    PlanChangeHistory,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Status/gateway enums are stored as plain strings so the same schema
        // works on Postgres and on SQLite (used by the test suite).
        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Users::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Users::Email).string().not_null().unique_key())
                    .col(ColumnDef::new(Users::Name).string().not_null())
                    .col(ColumnDef::new(Users::PasswordHash).string().not_null())
                    .col(ColumnDef::new(Users::Role).string().not_null())
                    .col(ColumnDef::new(Users::StripeCustomerId).string().null())
                    .col(
                        ColumnDef::new(Users::CreatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Users::UpdatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Courses::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Courses::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Courses::Title).string().not_null())
                    .col(ColumnDef::new(Courses::Description).string().null())
                    .col(ColumnDef::new(Courses::Price).double().not_null())
                    .col(ColumnDef::new(Courses::Currency).string().not_null())
                    .col(
                        ColumnDef::new(Courses::IsPublished)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Courses::CreatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Courses::UpdatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Enrollments::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Enrollments::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Enrollments::UserId).big_integer().not_null())
                    .col(ColumnDef::new(Enrollments::CourseId).big_integer().not_null())
                    .col(ColumnDef::new(Enrollments::Status).string().not_null())
                    .col(ColumnDef::new(Enrollments::PaymentTransactionId).string().null())
                    .col(
                        ColumnDef::new(Enrollments::EnrolledAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Enrollments::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Enrollments::CreatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Enrollments::UpdatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_enrollments_user_course")
                    .table(Enrollments::Table)
                    .col(Enrollments::UserId)
                    .col(Enrollments::CourseId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(SubscriptionPlans::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SubscriptionPlans::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPlans::Name)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(SubscriptionPlans::Description).string().null())
                    .col(ColumnDef::new(SubscriptionPlans::StripePriceId).string().null())
                    .col(ColumnDef::new(SubscriptionPlans::PaypalPlanId).string().null())
                    .col(ColumnDef::new(SubscriptionPlans::Price).double().not_null())
                    .col(ColumnDef::new(SubscriptionPlans::Currency).string().not_null())
                    .col(ColumnDef::new(SubscriptionPlans::Interval).string().not_null())
                    .col(
                        ColumnDef::new(SubscriptionPlans::IntervalCount)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPlans::TrialPeriodDays)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPlans::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPlans::CreatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SubscriptionPlans::UpdatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Payments::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Payments::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Payments::UserId).big_integer().not_null())
                    .col(ColumnDef::new(Payments::CourseId).big_integer().null())
                    .col(ColumnDef::new(Payments::EnrollmentId).big_integer().null())
                    .col(ColumnDef::new(Payments::SubscriptionId).big_integer().null())
                    .col(ColumnDef::new(Payments::Amount).double().not_null())
                    .col(
                        ColumnDef::new(Payments::AmountInSmallestUnit)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Payments::Currency).string().not_null())
                    .col(ColumnDef::new(Payments::PaymentGateway).string().not_null())
                    .col(ColumnDef::new(Payments::TransactionId).string().not_null())
                    .col(ColumnDef::new(Payments::Status).string().not_null())
                    .col(ColumnDef::new(Payments::GatewayStatus).string().null())
                    .col(ColumnDef::new(Payments::GatewayResponse).json().null())
                    .col(ColumnDef::new(Payments::CaptureId).string().null())
                    .col(ColumnDef::new(Payments::ApprovalLink).string().null())
                    .col(ColumnDef::new(Payments::RenewalReason).string().null())
                    .col(
                        ColumnDef::new(Payments::TotalRefundedInSmallestUnit)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Payments::RefundAttempts).json().null())
                    .col(
                        ColumnDef::new(Payments::CreatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Payments::UpdatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // One ledger row per gateway transaction
        manager
            .create_index(
                Index::create()
                    .name("idx_payments_gateway_transaction")
                    .table(Payments::Table)
                    .col(Payments::PaymentGateway)
                    .col(Payments::TransactionId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_payments_user_id")
                    .table(Payments::Table)
                    .col(Payments::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_payments_enrollment_id")
                    .table(Payments::Table)
                    .col(Payments::EnrollmentId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(UserSubscriptions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(UserSubscriptions::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(UserSubscriptions::UserId).big_integer().not_null())
                    .col(ColumnDef::new(UserSubscriptions::PlanId).big_integer().not_null())
                    .col(ColumnDef::new(UserSubscriptions::Gateway).string().not_null())
                    .col(ColumnDef::new(UserSubscriptions::StripeSubscriptionId).string().null())
                    .col(ColumnDef::new(UserSubscriptions::PaypalSubscriptionId).string().null())
                    .col(ColumnDef::new(UserSubscriptions::GatewayCustomerId).string().null())
                    .col(
                        ColumnDef::new(UserSubscriptions::GatewayPriceOrPlanId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(UserSubscriptions::Status).string().not_null())
                    .col(
                        ColumnDef::new(UserSubscriptions::CurrentPeriodStart)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(UserSubscriptions::CurrentPeriodEnd)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(UserSubscriptions::TrialStart)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(UserSubscriptions::TrialEnd)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(UserSubscriptions::CancelAtPeriodEnd)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(UserSubscriptions::CanceledAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(UserSubscriptions::EndedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(UserSubscriptions::LastGatewayStatus).string().null())
                    .col(
                        ColumnDef::new(UserSubscriptions::LastWebhookSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(UserSubscriptions::PlanChangeHistory).json().null())
                    .col(
                        ColumnDef::new(UserSubscriptions::CreatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(UserSubscriptions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_user_subscriptions_stripe_id")
                    .table(UserSubscriptions::Table)
                    .col(UserSubscriptions::StripeSubscriptionId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_user_subscriptions_paypal_id")
                    .table(UserSubscriptions::Table)
                    .col(UserSubscriptions::PaypalSubscriptionId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_user_subscriptions_user_gateway")
                    .table(UserSubscriptions::Table)
                    .col(UserSubscriptions::UserId)
                    .col(UserSubscriptions::Gateway)
                    .col(UserSubscriptions::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(UserSubscriptions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Payments::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SubscriptionPlans::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Enrollments::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Courses::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await?;
        Ok(())
    }
}
