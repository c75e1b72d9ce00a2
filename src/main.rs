use actix_web::{App, HttpServer, middleware::Logger, web};
use chrono::Local; // timestamp in log lines
use env_logger::{Env, Target};
use std::io::Write; // for env_logger custom formatter

use lms_backend::{
    config::Config,
    database::{create_pool, run_migrations},
    external::{PayPalGateway, StripeGateway},
    handlers,
    middlewares::{AuthMiddleware, create_cors},
    services::*,
    swagger::swagger_config,
    tasks,
    utils::JwtService,
};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let ts = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z");
            let level = record.level().as_str().to_ascii_lowercase();
            let msg_json = serde_json::to_string(&format!("{}", record.args()))
                .unwrap_or_else(|_| "\"<invalid utf8>\"".to_string());
            writeln!(
                buf,
                "{{\"timestamp\":\"{}\",\"level\":\"{}\",\"message\":{},\"target\":\"{}\"}}",
                ts,
                level,
                msg_json,
                record.target(),
            )
        })
        .target(Target::Stdout)
        .init();

    // 加载配置
    let config = Config::from_toml().expect("Failed to load configuration file");

    // 创建数据库连接池
    let pool = create_pool(&config.database)
        .await
        .expect("Failed to create database connection pool");

    // 运行数据库迁移
    run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");

    // 创建JWT服务
    let jwt_service = JwtService::new(
        &config.jwt.secret,
        config.jwt.access_token_expires_in,
        config.jwt.refresh_token_expires_in,
    );

    // 创建支付网关客户端
    let stripe_gateway = StripeGateway::new(config.stripe.clone());
    let paypal_gateway = PayPalGateway::new(config.paypal.clone());

    // 创建服务
    let auth_service = AuthService::new(pool.clone(), jwt_service.clone());
    let course_service = CourseService::new(pool.clone());
    let payment_service = PaymentService::new(
        pool.clone(),
        stripe_gateway.clone(),
        paypal_gateway.clone(),
        config.frontend.base_url.clone(),
    );
    let subscription_service = SubscriptionService::new(
        pool.clone(),
        stripe_gateway.clone(),
        paypal_gateway.clone(),
        config.frontend.base_url.clone(),
    );
    let webhook_service = WebhookService::new(
        pool.clone(),
        stripe_gateway.clone(),
        paypal_gateway.clone(),
        payment_service.clone(),
        subscription_service.clone(),
    );

    // 启动后台任务
    tasks::spawn_all(webhook_service.clone(), subscription_service.clone());

    // 启动HTTP服务器
    log::info!(
        "Starting HTTP server at {}:{}",
        config.server.host,
        config.server.port
    );

    let frontend_base_url = config.frontend.base_url.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(create_cors(&frontend_base_url))
            .wrap(AuthMiddleware::new(jwt_service.clone()))
            .app_data(web::Data::new(auth_service.clone()))
            .app_data(web::Data::new(course_service.clone()))
            .app_data(web::Data::new(payment_service.clone()))
            .app_data(web::Data::new(subscription_service.clone()))
            .app_data(web::Data::new(webhook_service.clone()))
            .configure(swagger_config)
            .configure(handlers::webhook_config)
            .service(
                web::scope("/api/v1")
                    .configure(handlers::auth_config)
                    .configure(handlers::course_config)
                    .configure(handlers::payment_config)
                    .configure(handlers::subscription_config),
            )
    })
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await
}
