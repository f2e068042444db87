//! Mainland-China IP database
//!
//! Two line-based files under the store directory, `chn_ip.txt` (IPv4) and
//! `chn_ip_v6.txt`, each line `start-ip end-ip`. Missing or empty files are
//! downloaded once. Ranges load into sorted vectors swapped in atomically;
//! membership is a binary search.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::{Error, Result};

const IPV4_LIST_FILE: &str = "chn_ip.txt";
const IPV6_LIST_FILE: &str = "chn_ip_v6.txt";

const IPV4_LIST_URL: &str =
    "https://raw.githubusercontent.com/mayaxcn/china-ip-list/refs/heads/master/chn_ip.txt";
const IPV6_LIST_URL: &str =
    "https://raw.githubusercontent.com/mayaxcn/china-ip-list/refs/heads/master/chn_ip_v6.txt";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Inclusive IPv4 range as host-order integers
#[derive(Debug, Clone, Copy)]
struct RangeV4 {
    start: u32,
    end: u32,
}

/// Inclusive IPv6 range as big-endian byte arrays
#[derive(Debug, Clone, Copy)]
struct RangeV6 {
    start: [u8; 16],
    end: [u8; 16],
}

/// Sorted, reloadable CN address ranges
#[derive(Default)]
pub struct CnIpDb {
    v4: RwLock<Vec<RangeV4>>,
    v6: RwLock<Vec<RangeV6>>,
}

impl CnIpDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load both lists from `store_dir`, downloading files that are missing
    /// or empty. The IPv4 list is required; an IPv6 failure only loses IPv6
    /// coverage. Returns the loaded (v4, v6) range counts.
    pub async fn load(&self, store_dir: &Path) -> Result<(usize, usize)> {
        let v4_path = store_dir.join(IPV4_LIST_FILE);
        ensure_list_file(&v4_path, IPV4_LIST_URL).await?;
        let text = tokio::fs::read_to_string(&v4_path).await?;
        let ranges = parse_v4_ranges(&text);
        if ranges.is_empty() {
            return Err(Error::Config(format!("{} contains no ranges", IPV4_LIST_FILE)));
        }
        let v4_count = ranges.len();
        *self.v4.write() = ranges;

        let v6_count = match self.load_v6(store_dir).await {
            Ok(n) => n,
            Err(e) => {
                warn!("[geoip] IPv6 list unavailable, continuing without it: {}", e);
                0
            }
        };

        Ok((v4_count, v6_count))
    }

    async fn load_v6(&self, store_dir: &Path) -> Result<usize> {
        let path = store_dir.join(IPV6_LIST_FILE);
        ensure_list_file(&path, IPV6_LIST_URL).await?;
        let text = tokio::fs::read_to_string(&path).await?;
        let ranges = parse_v6_ranges(&text);
        let count = ranges.len();
        *self.v6.write() = ranges;
        Ok(count)
    }

    /// Whether `ip` falls inside any loaded range.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match normalize(ip) {
            IpAddr::V4(v4) => {
                let needle = u32::from(v4);
                let ranges = self.v4.read();
                let idx = ranges.partition_point(|r| r.start <= needle);
                idx > 0 && ranges[idx - 1].end >= needle
            }
            IpAddr::V6(v6) => {
                let needle = v6.octets();
                let ranges = self.v6.read();
                let idx = ranges.partition_point(|r| r.start <= needle);
                idx > 0 && ranges[idx - 1].end >= needle
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        !self.v4.read().is_empty() || !self.v6.read().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn load_v4_from_str(&self, text: &str) {
        *self.v4.write() = parse_v4_ranges(text);
    }

    #[cfg(test)]
    pub(crate) fn load_v6_from_str(&self, text: &str) {
        *self.v6.write() = parse_v6_ranges(text);
    }
}

/// IPv4-mapped IPv6 addresses match against the IPv4 table.
fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    }
}

/// Parse `start end` lines, dropping blanks, comments, and inverted ranges.
fn parse_v4_ranges(text: &str) -> Vec<RangeV4> {
    let mut ranges: Vec<RangeV4> = text
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let mut parts = line.split_whitespace();
            let start: std::net::Ipv4Addr = parts.next()?.parse().ok()?;
            let end: std::net::Ipv4Addr = parts.next()?.parse().ok()?;
            let (start, end) = (u32::from(start), u32::from(end));
            (start <= end).then_some(RangeV4 { start, end })
        })
        .collect();
    ranges.sort_by_key(|r| r.start);
    ranges
}

fn parse_v6_ranges(text: &str) -> Vec<RangeV6> {
    let mut ranges: Vec<RangeV6> = text
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let mut parts = line.split_whitespace();
            let start: std::net::Ipv6Addr = parts.next()?.parse().ok()?;
            let end: std::net::Ipv6Addr = parts.next()?.parse().ok()?;
            let (start, end) = (start.octets(), end.octets());
            (start <= end).then_some(RangeV6 { start, end })
        })
        .collect();
    ranges.sort_by_key(|r| r.start);
    ranges
}

/// Download the list when the file is missing or zero-size.
async fn ensure_list_file(path: &Path, url: &str) -> Result<()> {
    let needs_download = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len() == 0,
        Err(_) => true,
    };
    if !needs_download {
        return Ok(());
    }

    info!("[geoip] downloading IP list from {}", url);
    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| Error::Config(e.to_string()))?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Config(format!("download failed: {}", e)))?;
    if !response.status().is_success() {
        return Err(Error::Config(format!(
            "download failed: HTTP {}",
            response.status()
        )));
    }
    let content = response
        .bytes()
        .await
        .map_err(|e| Error::Config(format!("download read failed: {}", e)))?;

    tokio::fs::write(path, &content).await?;
    info!("[geoip] saved {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_v4_membership_boundaries() {
        let db = CnIpDb::new();
        db.load_v4_from_str("10.0.0.0 10.0.0.255\n");

        assert!(db.contains(ip("10.0.0.0")));
        assert!(db.contains(ip("10.0.0.128")));
        assert!(db.contains(ip("10.0.0.255")));
        assert!(!db.contains(ip("9.255.255.255")));
        assert!(!db.contains(ip("10.0.1.0")));
    }

    #[test]
    fn test_v6_membership_boundaries() {
        let db = CnIpDb::new();
        db.load_v6_from_str("2001:db8:: 2001:db8::ff\n");

        assert!(db.contains(ip("2001:db8::")));
        assert!(db.contains(ip("2001:db8::80")));
        assert!(db.contains(ip("2001:db8::ff")));
        assert!(!db.contains(ip("2001:db8::100")));
        assert!(!db.contains(ip("2001:db7:ffff:ffff:ffff:ffff:ffff:ffff")));
    }

    #[test]
    fn test_parser_skips_comments_and_bad_lines() {
        let db = CnIpDb::new();
        db.load_v4_from_str(
            "# header\n\n1.0.0.0 1.0.0.255\nnot-an-ip also-not\n8.8.8.8 8.8.4.4\n2.0.0.0 2.0.0.10\n",
        );

        // Inverted range 8.8.8.8-8.8.4.4 must be dropped
        assert!(!db.contains(ip("8.8.8.8")));
        assert!(db.contains(ip("1.0.0.200")));
        assert!(db.contains(ip("2.0.0.5")));
    }

    #[test]
    fn test_unsorted_input_is_sorted_on_load() {
        let db = CnIpDb::new();
        db.load_v4_from_str("100.0.0.0 100.0.0.255\n1.0.0.0 1.0.0.255\n50.0.0.0 50.0.0.255\n");

        assert!(db.contains(ip("50.0.0.100")));
        assert!(db.contains(ip("1.0.0.1")));
        assert!(db.contains(ip("100.0.0.1")));
        assert!(!db.contains(ip("75.0.0.1")));
    }

    #[test]
    fn test_v4_mapped_v6_uses_v4_table() {
        let db = CnIpDb::new();
        db.load_v4_from_str("1.0.0.0 1.255.255.255\n");
        assert!(db.contains(ip("::ffff:1.1.1.1")));
    }
}
