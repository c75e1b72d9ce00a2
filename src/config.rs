use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub stripe: StripeConfig,
    pub paypal: PayPalConfig,
    #[serde(default)]
    pub frontend: FrontendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub access_token_expires_in: i64,  // seconds
    pub refresh_token_expires_in: i64, // seconds
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayPalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub base_url: String,
    /// Webhook id from the PayPal developer dashboard, required to verify
    /// webhook signatures.
    pub webhook_id: String,
    #[serde(default = "default_brand_name")]
    pub brand_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendConfig {
    pub base_url: String,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
        }
    }
}

fn default_brand_name() -> String {
    "LMS".to_string()
}

impl Config {
    pub fn from_toml() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
        use std::io::ErrorKind;

        // 尝试读取配置文件，如果不存在则完全依赖环境变量
        let config_result = std::fs::read_to_string(&config_path);

        let mut config: Config = match config_result {
            Ok(config_str) => {
                // 有配置文件：先解析再用环境变量覆盖
                toml::from_str(&config_str).map_err(|e| format!("解析配置文件失败: {e}"))?
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // 无配置文件：使用环境变量与默认值构建
                fn get_env(name: &str) -> Option<String> {
                    env::var(name).ok()
                }
                fn get_env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
                    env::var(name)
                        .ok()
                        .and_then(|v| v.parse::<T>().ok())
                        .unwrap_or(default)
                }

                // 数据库 URL 在无配置文件时必须提供
                let database_url = get_env("DATABASE_URL")
                    .ok_or("缺少 DATABASE_URL 环境变量，且未找到配置文件 config.toml")?;

                Config {
                    server: ServerConfig {
                        host: get_env("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                        port: get_env_parse("SERVER_PORT", 8080u16),
                    },
                    database: DatabaseConfig {
                        url: database_url,
                        max_connections: get_env_parse("DB_MAX_CONNECTIONS", 10u32),
                    },
                    jwt: JwtConfig {
                        secret: get_env("JWT_SECRET")
                            .unwrap_or_else(|| "change-me-in-production".to_string()),
                        access_token_expires_in: get_env_parse("JWT_ACCESS_EXPIRES_IN", 7200i64),
                        refresh_token_expires_in: get_env_parse(
                            "JWT_REFRESH_EXPIRES_IN",
                            2_592_000i64,
                        ),
                    },
                    stripe: StripeConfig {
                        secret_key: get_env("STRIPE_SECRET_KEY").unwrap_or_default(),
                        webhook_secret: get_env("STRIPE_WEBHOOK_SECRET").unwrap_or_default(),
                    },
                    paypal: PayPalConfig {
                        client_id: get_env("PAYPAL_CLIENT_ID").unwrap_or_default(),
                        client_secret: get_env("PAYPAL_CLIENT_SECRET").unwrap_or_default(),
                        base_url: get_env("PAYPAL_BASE_URL")
                            .unwrap_or_else(|| "https://api-m.sandbox.paypal.com".to_string()),
                        webhook_id: get_env("PAYPAL_WEBHOOK_ID").unwrap_or_default(),
                        brand_name: get_env("PAYPAL_BRAND_NAME")
                            .unwrap_or_else(default_brand_name),
                    },
                    frontend: FrontendConfig {
                        base_url: get_env("FRONTEND_BASE_URL")
                            .unwrap_or_else(|| "http://localhost:3000".to_string()),
                    },
                }
            }
            Err(e) => {
                return Err(format!("无法读取配置文件 {config_path}: {e}").into());
            }
        };

        // 环境变量覆盖（即便文件存在时也覆盖）
        if let Ok(v) = env::var("SERVER_HOST") {
            config.server.host = v;
        }
        if let Ok(v) = env::var("SERVER_PORT")
            && let Ok(p) = v.parse()
        {
            config.server.port = p;
        }
        if let Ok(v) = env::var("DATABASE_URL") {
            config.database.url = v;
        }
        if let Ok(v) = env::var("DB_MAX_CONNECTIONS")
            && let Ok(mc) = v.parse()
        {
            config.database.max_connections = mc;
        }
        if let Ok(v) = env::var("JWT_SECRET") {
            config.jwt.secret = v;
        }
        if let Ok(v) = env::var("JWT_ACCESS_EXPIRES_IN")
            && let Ok(n) = v.parse()
        {
            config.jwt.access_token_expires_in = n;
        }
        if let Ok(v) = env::var("JWT_REFRESH_EXPIRES_IN")
            && let Ok(n) = v.parse()
        {
            config.jwt.refresh_token_expires_in = n;
        }
        if let Ok(v) = env::var("STRIPE_SECRET_KEY") {
            config.stripe.secret_key = v;
        }
        if let Ok(v) = env::var("STRIPE_WEBHOOK_SECRET") {
            config.stripe.webhook_secret = v;
        }
        if let Ok(v) = env::var("PAYPAL_CLIENT_ID") {
            config.paypal.client_id = v;
        }
        if let Ok(v) = env::var("PAYPAL_CLIENT_SECRET") {
            config.paypal.client_secret = v;
        }
        if let Ok(v) = env::var("PAYPAL_BASE_URL") {
            config.paypal.base_url = v;
        }
        if let Ok(v) = env::var("PAYPAL_WEBHOOK_ID") {
            config.paypal.webhook_id = v;
        }
        if let Ok(v) = env::var("PAYPAL_BRAND_NAME") {
            config.paypal.brand_name = v;
        }
        if let Ok(v) = env::var("FRONTEND_BASE_URL") {
            config.frontend.base_url = v;
        }

        Ok(config)
    }
}
