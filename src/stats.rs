//! Cache statistics and memory overview.
//!
//! A quick summary of what each source holds and how its cache is behaving:
//! hit rates, evictions, and resident bytes against the configured budget.

use serde::Serialize;

use crate::cache::CacheStats;
use crate::progress::format_number;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub local_entries: usize,
    pub remote: Option<CacheStats>,
    pub collection: Option<CacheStats>,
    /// Keys with a recorded last-synced state.
    pub baseline_entries: usize,
}

impl EngineStats {
    /// Resident bytes across the remote-backed caches.
    pub fn cached_bytes(&self) -> usize {
        [self.remote, self.collection]
            .iter()
            .flatten()
            .map(|s| s.bytes)
            .sum()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("Element Index Stats\n");
        out.push_str("===================\n\n");
        out.push_str(&format!(
            "  Local:       {} elements\n",
            format_number(self.local_entries as u64)
        ));
        out.push_str(&format!(
            "  Baseline:    {} keys\n",
            format_number(self.baseline_entries as u64)
        ));
        out.push_str(&format!(
            "  Cached:      {}\n\n",
            format_bytes(self.cached_bytes() as u64)
        ));

        out.push_str(&format!(
            "  {:<18} {:>8} {:>8} {:>6} {:>9} {:>10}\n",
            "CACHE", "HITS", "MISSES", "STALE", "EVICTED", "SIZE"
        ));
        out.push_str(&format!("  {}\n", "-".repeat(64)));
        for (name, stats) in [("remote-portfolio", self.remote), ("collection", self.collection)] {
            match stats {
                Some(s) => out.push_str(&format!(
                    "  {:<18} {:>8} {:>8} {:>6} {:>9} {:>10}\n",
                    name,
                    format_number(s.hits),
                    format_number(s.misses),
                    format_number(s.stale_hits),
                    format_number(s.evictions + s.expirations),
                    format_bytes(s.bytes as u64)
                )),
                None => out.push_str(&format!("  {:<18} not configured\n", name)),
            }
        }
        out
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
