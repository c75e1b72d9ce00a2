use actix_cors::Cors;

pub fn create_cors(frontend_base_url: &str) -> Cors {
    let allowed = frontend_base_url.trim_end_matches('/').to_string();
    Cors::default()
        .allowed_origin_fn(move |origin, _req_head| {
            origin
                .to_str()
                .map(|o| origin_allowed(&allowed, o))
                .unwrap_or(false)
        })
        .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
        // 放宽 Header 限制，防止前端自定义 Header 导致预检失败
        .allow_any_header()
        // 如果前端使用 Cookie（如刷新令牌）、或需要携带凭据，需开启
        .supports_credentials()
        .max_age(3600)
}

/// 只放行配置的前端域名；本地开发调试时放行 localhost
fn origin_allowed(allowed: &str, origin: &str) -> bool {
    origin == allowed || origin.starts_with("http://localhost")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_configured_frontend_origin_is_allowed() {
        assert!(origin_allowed("https://app.example.com", "https://app.example.com"));
        assert!(!origin_allowed("https://app.example.com", "https://evil.example.com"));
        assert!(!origin_allowed(
            "https://app.example.com",
            "https://app.example.com.evil.net"
        ));
    }

    #[test]
    fn test_localhost_is_allowed_for_development() {
        assert!(origin_allowed("https://app.example.com", "http://localhost:3000"));
    }
}
