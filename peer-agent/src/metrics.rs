//! Lightweight Prometheus-compatible metrics for the peer agent.
//!
//! Uses atomic counters for lock-free instrumentation. Renders metrics in
//! Prometheus text exposition format for dumping on demand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lightweight Prometheus-compatible metrics for the peer agent.
pub struct Metrics {
    /// Total attribute messages applied to local entities (counter)
    pub applied_total: AtomicU64,
    /// Total messages deferred to the cache for replay (counter)
    pub deferred_total: AtomicU64,
    /// Total entity announcements received (counter)
    pub announced_total: AtomicU64,
    /// Total peer connections established (counter)
    pub peer_connections_total: AtomicU64,
    /// Total peer connections lost (counter)
    pub peer_losses_total: AtomicU64,
    /// Agent start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            applied_total: AtomicU64::new(0),
            deferred_total: AtomicU64::new(0),
            announced_total: AtomicU64::new(0),
            peer_connections_total: AtomicU64::new(0),
            peer_losses_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP peer_agent_applied_total Total attribute messages applied\n\
             # TYPE peer_agent_applied_total counter\n\
             peer_agent_applied_total {}\n\
             # HELP peer_agent_deferred_total Total messages deferred for replay\n\
             # TYPE peer_agent_deferred_total counter\n\
             peer_agent_deferred_total {}\n\
             # HELP peer_agent_announced_total Total entity announcements received\n\
             # TYPE peer_agent_announced_total counter\n\
             peer_agent_announced_total {}\n\
             # HELP peer_agent_peer_connections_total Total peer connections established\n\
             # TYPE peer_agent_peer_connections_total counter\n\
             peer_agent_peer_connections_total {}\n\
             # HELP peer_agent_peer_losses_total Total peer connections lost\n\
             # TYPE peer_agent_peer_losses_total counter\n\
             peer_agent_peer_losses_total {}\n\
             # HELP peer_agent_uptime_seconds Agent uptime in seconds\n\
             # TYPE peer_agent_uptime_seconds gauge\n\
             peer_agent_uptime_seconds {}\n",
            self.applied_total.load(Ordering::Relaxed),
            self.deferred_total.load(Ordering::Relaxed),
            self.announced_total.load(Ordering::Relaxed),
            self.peer_connections_total.load(Ordering::Relaxed),
            self.peer_losses_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_default_zero() {
        let m = Metrics::new();
        assert_eq!(m.applied_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.deferred_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.announced_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.peer_connections_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.peer_losses_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_metrics_render_format() {
        let m = Metrics::new();
        m.applied_total.fetch_add(42, Ordering::Relaxed);
        m.deferred_total.fetch_add(7, Ordering::Relaxed);
        let output = m.render();
        assert!(output.contains("peer_agent_applied_total 42"));
        assert!(output.contains("peer_agent_deferred_total 7"));
        assert!(output.contains("peer_agent_announced_total 0"));
    }

    #[test]
    fn test_metrics_render_prometheus_format() {
        let m = Metrics::new();
        let output = m.render();
        assert!(output.contains("# HELP peer_agent_applied_total"));
        assert!(output.contains("# TYPE peer_agent_applied_total counter"));
        assert!(output.contains("# HELP peer_agent_uptime_seconds"));
        assert!(output.contains("# TYPE peer_agent_uptime_seconds gauge"));
        assert!(output
            .lines()
            .any(|l| l.starts_with("peer_agent_uptime_seconds ")));
    }
}
