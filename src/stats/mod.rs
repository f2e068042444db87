//! Per-host traffic statistics
//!
//! The in-memory map is authoritative; disk holds a snapshot written every
//! five minutes and on shutdown. Sites below a 10 KiB combined threshold are
//! left out of the snapshot to bound file size.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

const STATS_FILE: &str = "traffic_stats.json";

/// Sites below this combined byte count are not persisted
const MIN_SAVE_THRESHOLD: u64 = 10 * 1024;

/// Interval between automatic snapshots
pub const AUTOSAVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Counters for one destination host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteStats {
    pub host: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
    pub first_access: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    sites: HashMap<String, SiteStats>,
    total_upload: u64,
    total_download: u64,
    #[serde(default = "Utc::now")]
    saved_at: DateTime<Utc>,
}

struct StatsInner {
    sites: HashMap<String, SiteStats>,
    total_upload: u64,
    total_download: u64,
    last_sample: Option<(Instant, u64, u64)>,
}

/// Traffic accounting shared by every session
pub struct TrafficStats {
    inner: Mutex<StatsInner>,
    store_dir: PathBuf,
}

impl TrafficStats {
    /// Create the store, restoring the previous snapshot when one exists.
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        let store_dir = store_dir.into();
        let mut inner = StatsInner {
            sites: HashMap::new(),
            total_upload: 0,
            total_download: 0,
            last_sample: None,
        };

        if let Some(snapshot) = load_snapshot(&store_dir.join(STATS_FILE)) {
            inner.sites = snapshot.sites;
            inner.total_upload = snapshot.total_upload;
            inner.total_download = snapshot.total_download;
        }

        Self {
            inner: Mutex::new(inner),
            store_dir,
        }
    }

    pub fn record_connection(&self, host: &str) {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        inner
            .sites
            .entry(host.to_string())
            .and_modify(|site| {
                site.connections += 1;
                site.last_access = now;
            })
            .or_insert_with(|| SiteStats {
                host: host.to_string(),
                upload: 0,
                download: 0,
                connections: 1,
                first_access: now,
                last_access: now,
            });
    }

    pub fn record_upload(&self, host: &str, bytes: u64) {
        let mut inner = self.inner.lock();
        inner.total_upload += bytes;
        if let Some(site) = inner.sites.get_mut(host) {
            site.upload += bytes;
            site.last_access = Utc::now();
        }
    }

    pub fn record_download(&self, host: &str, bytes: u64) {
        let mut inner = self.inner.lock();
        inner.total_download += bytes;
        if let Some(site) = inner.sites.get_mut(host) {
            site.download += bytes;
            site.last_access = Utc::now();
        }
    }

    pub fn get_site_stats(&self, host: &str) -> Option<SiteStats> {
        self.inner.lock().sites.get(host).cloned()
    }

    pub fn get_all_stats(&self) -> Vec<SiteStats> {
        self.inner.lock().sites.values().cloned().collect()
    }

    /// Sites ordered by combined traffic, largest first.
    pub fn get_top_sites(&self, n: usize) -> Vec<SiteStats> {
        let mut all = self.get_all_stats();
        all.sort_by_key(|s| std::cmp::Reverse(s.upload + s.download));
        all.truncate(n);
        all
    }

    pub fn get_total_stats(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.total_upload, inner.total_download)
    }

    /// Bytes per second since the previous call, `(upload, download)`.
    pub fn speed(&self) -> (u64, u64) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let totals = (inner.total_upload, inner.total_download);

        let rate = match inner.last_sample {
            Some((at, up, down)) => {
                let secs = now.duration_since(at).as_secs_f64();
                if secs > 0.0 {
                    // saturating: a reset between samples drops the totals
                    (
                        (totals.0.saturating_sub(up) as f64 / secs) as u64,
                        (totals.1.saturating_sub(down) as f64 / secs) as u64,
                    )
                } else {
                    (0, 0)
                }
            }
            None => (0, 0),
        };

        inner.last_sample = Some((now, totals.0, totals.1));
        rate
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.sites.clear();
        inner.total_upload = 0;
        inner.total_download = 0;
    }

    /// Write the snapshot, dropping sites below the persistence threshold.
    pub fn save(&self) -> Result<()> {
        let snapshot = {
            let inner = self.inner.lock();
            Snapshot {
                sites: inner
                    .sites
                    .iter()
                    .filter(|(_, site)| site.upload + site.download >= MIN_SAVE_THRESHOLD)
                    .map(|(host, site)| (host.clone(), site.clone()))
                    .collect(),
                total_upload: inner.total_upload,
                total_download: inner.total_download,
                saved_at: Utc::now(),
            }
        };

        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| crate::error::Error::Config(format!("failed to encode stats: {}", e)))?;
        std::fs::write(self.store_dir.join(STATS_FILE), json)?;
        Ok(())
    }

    /// Formatted overview used by the `status` REPL command.
    pub fn summary(&self, top_n: usize) -> String {
        use std::fmt::Write;

        let (upload, download) = self.get_total_stats();
        let top = self.get_top_sites(top_n);
        let site_count = self.inner.lock().sites.len();

        let mut out = String::new();
        let _ = writeln!(out, "========== traffic ==========");
        let _ = writeln!(out, "upload:   {}", format_bytes(upload));
        let _ = writeln!(out, "download: {}", format_bytes(download));
        let _ = writeln!(out, "total:    {}", format_bytes(upload + download));
        let _ = writeln!(out, "sites:    {}", site_count);
        if !top.is_empty() {
            let _ = writeln!(out, "--- top {} sites ---", top.len());
            for (i, site) in top.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "{}. {}  up {}  down {}  conns {}",
                    i + 1,
                    site.host,
                    format_bytes(site.upload),
                    format_bytes(site.download),
                    site.connections
                );
            }
        }
        out.push_str("=============================");
        out
    }
}

fn load_snapshot(path: &Path) -> Option<Snapshot> {
    let data = std::fs::read(path).ok()?;
    match serde_json::from_slice(&data) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            debug!("[stats] ignoring unreadable snapshot {}: {}", path.display(), e);
            None
        }
    }
}

/// Human-readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
