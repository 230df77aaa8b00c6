//! Nginx config rendering.

use sha2::{Digest, Sha256};

/// Render the `server` block routing `{app}.{domain_suffix}` to a local
/// backend port.
///
/// Host-header routing with websocket upgrade support; the backend is
/// always a loopback port bound by the app's container.
pub fn render_server_block(app_name: &str, port: u16, domain_suffix: &str) -> String {
    format!(
        r#"server {{
    listen 80;
    server_name {app_name}.{domain_suffix};

    location / {{
        proxy_pass http://127.0.0.1:{port};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
    }}
}}
"#
    )
}

/// Content fingerprint used to skip no-op syncs.
pub(crate) fn fingerprint(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_block_routes_host_to_port() {
        let conf = render_server_block("shop", 8001, "apps.example.com");
        assert!(conf.contains("server_name shop.apps.example.com;"));
        assert!(conf.contains("proxy_pass http://127.0.0.1:8001;"));
        // Websocket upgrade headers present.
        assert!(conf.contains("proxy_set_header Upgrade $http_upgrade;"));
    }

    #[test]
    fn fingerprint_is_content_sensitive() {
        let a = render_server_block("shop", 8001, "local");
        let b = render_server_block("shop", 8002, "local");
        assert_eq!(fingerprint(&a), fingerprint(&a));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }
}
