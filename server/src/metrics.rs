//! Prometheus metrics exported on the HTTP surface

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Counters and gauges shared by the transport, pipeline and alert engine
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub active_agents: IntGauge,
    pub packets_processed: IntCounter,
    pub alerts_generated: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let active_agents = IntGauge::new("active_agents", "Number of active monitoring agents")
            .expect("static metric definition");
        let packets_processed = IntCounter::new("packets_processed", "Total number of processed packets")
            .expect("static metric definition");
        let alerts_generated = IntCounter::new("alerts_generated", "Total number of security alerts")
            .expect("static metric definition");

        for collector in [
            Box::new(active_agents.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(packets_processed.clone()),
            Box::new(alerts_generated.clone()),
        ] {
            if let Err(e) = registry.register(collector) {
                tracing::warn!("metric registration failed: {}", e);
            }
        }

        Self {
            registry,
            active_agents,
            packets_processed,
            alerts_generated,
        }
    }

    /// Render the registry in the Prometheus text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("metrics encoding failed: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
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
    fn test_render_contains_all_series() {
        let metrics = Metrics::new();
        metrics.active_agents.inc();
        metrics.packets_processed.inc_by(3);

        let text = metrics.render();
        assert!(text.contains("active_agents 1"));
        assert!(text.contains("packets_processed 3"));
        assert!(text.contains("alerts_generated 0"));
    }
}
