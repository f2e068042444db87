//! Routing decider: tunnel or direct per target
//!
//! The decision depends only on the target host, the configured mode and the
//! CN-IP database. Name resolution goes through the `HostResolver` trait so
//! tests can pin answers instead of depending on the OS resolver cache.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tracing::debug;

use crate::config::RoutingMode;
use crate::geoip::CnIpDb;

/// Name resolution seam
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        Ok(lookup_host((host, 0)).await?.map(|a| a.ip()).collect())
    }
}

/// Per-run routing decider
pub struct Decider {
    mode: RoutingMode,
    db: Arc<CnIpDb>,
    resolver: Arc<dyn HostResolver>,
}

impl Decider {
    pub fn new(mode: RoutingMode, db: Arc<CnIpDb>) -> Self {
        Self::with_resolver(mode, db, Arc::new(SystemResolver))
    }

    pub fn with_resolver(
        mode: RoutingMode,
        db: Arc<CnIpDb>,
        resolver: Arc<dyn HostResolver>,
    ) -> Self {
        Self { mode, db, resolver }
    }

    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    /// Whether `host` should connect directly instead of through the tunnel.
    ///
    /// Private and loopback destinations always go direct. In `bypass_cn`
    /// mode a name goes direct when ANY resolved address is Chinese: a
    /// poisoned answer mixing foreign addresses into a Chinese name must not
    /// pull that name into the tunnel. Resolution failure keeps the target
    /// on the tunnel.
    pub async fn should_bypass(&self, host: &str) -> bool {
        if self.mode == RoutingMode::None {
            return true;
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            if is_private_ip(ip) {
                debug!("[router] {} is private, forcing direct", host);
                return true;
            }
            return self.mode == RoutingMode::BypassCn && self.db.contains(ip);
        }

        let ips = self.resolver.lookup(host).await.unwrap_or_default();
        if !ips.is_empty() && ips.iter().all(|ip| is_private_ip(*ip)) {
            debug!("[router] {} resolves only to private addresses, forcing direct", host);
            return true;
        }

        self.mode == RoutingMode::BypassCn && ips.iter().any(|ip| self.db.contains(*ip))
    }
}

/// Loopback, link-local, RFC 1918 and unique-local addresses
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || (v6.segments()[0] & 0xffc0) == 0xfe80 // link-local fe80::/10
                || (v6.segments()[0] & 0xfe00) == 0xfc00 // unique-local fc00::/7
                || v6.to_ipv4_mapped().map(|v4| {
                    v4.is_loopback() || v4.is_private() || v4.is_link_local()
                }).unwrap_or(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeResolver {
        answers: HashMap<String, Vec<IpAddr>>,
    }

    impl FakeResolver {
        fn new(entries: &[(&str, &[&str])]) -> Arc<Self> {
            let answers = entries
                .iter()
                .map(|(host, ips)| {
                    (
                        host.to_string(),
                        ips.iter().map(|s| s.parse().unwrap()).collect(),
                    )
                })
                .collect();
            Arc::new(Self { answers })
        }
    }

    #[async_trait]
    impl HostResolver for FakeResolver {
        async fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
            self.answers
                .get(host)
                .cloned()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no such host"))
        }
    }

    fn cn_db() -> Arc<CnIpDb> {
        let db = CnIpDb::new();
        // 114.114.0.0/16 stands in for the CN table
        db.load_v4_from_str("114.114.0.0 114.114.255.255\n");
        Arc::new(db)
    }

    fn resolver() -> Arc<FakeResolver> {
        FakeResolver::new(&[
            ("mixed.example", &["1.2.3.4", "114.114.114.114"]),
            ("foreign.example", &["1.2.3.4"]),
            ("intranet.example", &["192.168.1.10"]),
        ])
    }

    #[tokio::test]
    async fn test_bypass_cn_any_chinese_ip_wins() {
        let decider = Decider::with_resolver(RoutingMode::BypassCn, cn_db(), resolver());
        assert!(decider.should_bypass("mixed.example").await);
        assert!(!decider.should_bypass("foreign.example").await);
    }

    #[tokio::test]
    async fn test_global_never_bypasses_public_targets() {
        let decider = Decider::with_resolver(RoutingMode::Global, cn_db(), resolver());
        assert!(!decider.should_bypass("mixed.example").await);
        assert!(!decider.should_bypass("114.114.114.114").await);
    }

    #[tokio::test]
    async fn test_none_always_bypasses() {
        let decider = Decider::with_resolver(RoutingMode::None, cn_db(), resolver());
        assert!(decider.should_bypass("mixed.example").await);
        assert!(decider.should_bypass("8.8.8.8").await);
    }

    #[tokio::test]
    async fn test_private_targets_bypass_in_every_mode() {
        for mode in [RoutingMode::Global, RoutingMode::BypassCn, RoutingMode::None] {
            let decider = Decider::with_resolver(mode, cn_db(), resolver());
            assert!(decider.should_bypass("127.0.0.1").await, "mode {}", mode);
            assert!(decider.should_bypass("10.1.2.3").await, "mode {}", mode);
            assert!(decider.should_bypass("intranet.example").await, "mode {}", mode);
        }
    }

    #[tokio::test]
    async fn test_resolution_failure_stays_on_tunnel() {
        let decider = Decider::with_resolver(RoutingMode::BypassCn, cn_db(), resolver());
        assert!(!decider.should_bypass("unknown.example").await);
    }

    #[tokio::test]
    async fn test_literal_cn_ip_bypasses_in_bypass_cn() {
        let decider = Decider::with_resolver(RoutingMode::BypassCn, cn_db(), resolver());
        assert!(decider.should_bypass("114.114.114.114").await);
        assert!(!decider.should_bypass("1.2.3.4").await);
    }

    #[test]
    fn test_private_ip_classification() {
        let private = ["127.0.0.1", "10.0.0.1", "172.16.5.5", "192.168.0.1",
                       "169.254.1.1", "::1", "fe80::1", "fd00::1"];
        for ip in private {
            assert!(is_private_ip(ip.parse().unwrap()), "{}", ip);
        }
        let public = ["8.8.8.8", "1.1.1.1", "2606:4700::1111"];
        for ip in public {
            assert!(!is_private_ip(ip.parse().unwrap()), "{}", ip);
        }
    }
}
