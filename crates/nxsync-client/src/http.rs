use crate::cookies::SessionJar;
use crate::proxy::ProxyResolution;
use crate::util::env_u64;
use crate::TransferError;
use std::sync::Arc;
use std::time::Duration;

fn connect_timeout() -> Duration {
    Duration::from_secs(env_u64("NXSYNC_HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(10).max(1))
}

fn keepalive() -> Duration {
    Duration::from_secs(env_u64("NXSYNC_HTTP_TCP_KEEPALIVE_SECS").unwrap_or(60).max(1))
}

fn pool_idle() -> Duration {
    Duration::from_secs(env_u64("NXSYNC_HTTP_POOL_IDLE_SECS").unwrap_or(90).max(1))
}

/// Base client builder with harmonized defaults. Request timeouts are set
/// per call since control and blob requests use different limits.
pub fn builder(user_agent: &str) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .connect_timeout(connect_timeout())
        .tcp_keepalive(keepalive())
        .pool_idle_timeout(pool_idle())
}

/// Client sharing `jar` and routed per `proxy`.
pub fn client(
    user_agent: &str,
    proxy: &ProxyResolution,
    jar: Arc<SessionJar>,
) -> Result<reqwest::Client, TransferError> {
    let builder = proxy.apply(builder(user_agent).cookie_provider(jar))?;
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn env_knobs_are_floored_at_one_second() {
        std::env::set_var("NXSYNC_HTTP_CONNECT_TIMEOUT_SECS", "0");
        assert_eq!(connect_timeout(), Duration::from_secs(1));
        std::env::set_var("NXSYNC_HTTP_CONNECT_TIMEOUT_SECS", "7");
        assert_eq!(connect_timeout(), Duration::from_secs(7));
        std::env::remove_var("NXSYNC_HTTP_CONNECT_TIMEOUT_SECS");
        assert_eq!(connect_timeout(), Duration::from_secs(10));
        assert_eq!(pool_idle(), Duration::from_secs(90));
    }

    #[test]
    fn builds_with_each_proxy_resolution() {
        let jar = Arc::new(SessionJar::default());
        assert!(client("Nuxeo Drive/1.0", &ProxyResolution::Disabled, jar.clone()).is_ok());
        assert!(client("Nuxeo Drive/1.0", &ProxyResolution::System, jar).is_ok());
    }
}
