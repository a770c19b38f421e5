use std::borrow::Cow;

use anyhow::Context;
use tokio::net::TcpListener;

/// Normalize a bind/listen address.
///
/// Expands `":PORT"` and `"*:PORT"` to `"0.0.0.0:PORT"`; anything else is
/// passed through trimmed.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    match addr.strip_prefix('*').unwrap_or(addr) {
        port if port.starts_with(':') => Cow::Owned(format!("0.0.0.0{port}")),
        _ => Cow::Borrowed(addr),
    }
}

pub async fn bind(addr: &str, what: &str) -> anyhow::Result<TcpListener> {
    let normalized = normalize_bind_addr(addr);
    TcpListener::bind(normalized.as_ref())
        .await
        .with_context(|| format!("{what}: bind {addr}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
        assert_eq!(normalize_bind_addr("*:443").as_ref(), "0.0.0.0:443");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[tokio::test]
    async fn bind_reports_the_address() {
        let l = bind("127.0.0.1:0", "test").await.unwrap();
        let taken = l.local_addr().unwrap().to_string();
        let err = bind(&taken, "dispatch").await.unwrap_err();
        assert!(format!("{err}").contains("dispatch: bind"));
    }
}
