//! Prometheus counters served by the built-in `Metrics` service.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("metric registration failed: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("metric text is not utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Clone)]
struct Counters {
    requests_received: IntCounter,
    frames_sent: IntCounter,
    channel_payloads: IntCounter,
    /// Final responses sent, by `code`.
    responses_sent: IntCounterVec,
}

impl Counters {
    fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let requests_received = IntCounter::new(
            "termnet_requests_received_total",
            "Requests delivered to this terminal",
        )?;
        registry.register(Box::new(requests_received.clone()))?;
        let frames_sent = IntCounter::new(
            "termnet_frames_sent_total",
            "Streaming frames sent by local services",
        )?;
        registry.register(Box::new(frames_sent.clone()))?;
        let channel_payloads = IntCounter::new(
            "termnet_channel_payloads_total",
            "Channel payloads delivered to local subscribers",
        )?;
        registry.register(Box::new(channel_payloads.clone()))?;
        let responses_sent = IntCounterVec::new(
            Opts::new("termnet_responses_sent_total", "Final responses sent, by code"),
            &["code"],
        )?;
        registry.register(Box::new(responses_sent.clone()))?;
        Ok(Self {
            requests_received,
            frames_sent,
            channel_payloads,
            responses_sent,
        })
    }
}

/// One registry per terminal, so several terminals in a process keep apart.
pub struct Metrics {
    registry: Registry,
    counters: Option<Counters>,
}

impl Default for Metrics {
    fn default() -> Self {
        let registry = Registry::new();
        let counters = match Counters::register(&registry) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::error!(error = %e, "metrics disabled");
                None
            }
        };
        Self { registry, counters }
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("enabled", &self.counters.is_some())
            .finish()
    }
}

impl Metrics {
    pub fn request_received(&self) {
        if let Some(c) = &self.counters {
            c.requests_received.inc();
        }
    }

    pub fn frame_sent(&self) {
        if let Some(c) = &self.counters {
            c.frames_sent.inc();
        }
    }

    pub fn channel_payload(&self) {
        if let Some(c) = &self.counters {
            c.channel_payloads.inc();
        }
    }

    pub fn response_sent(&self, code: u16) {
        if let Some(c) = &self.counters {
            c.responses_sent.with_label_values(&[&code.to_string()]).inc();
        }
    }

    pub fn requests_received(&self) -> u64 {
        self.counters.as_ref().map_or(0, |c| c.requests_received.get())
    }

    pub fn responses_sent(&self, code: u16) -> u64 {
        self.counters
            .as_ref()
            .map_or(0, |c| c.responses_sent.with_label_values(&[&code.to_string()]).get())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every counter.
    pub fn render(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_code() {
        let m = Metrics::default();
        m.request_received();
        m.response_sent(0);
        m.response_sent(0);
        m.response_sent(503);
        assert_eq!(m.requests_received(), 1);
        assert_eq!(m.responses_sent(0), 2);
        assert_eq!(m.responses_sent(503), 1);

        let text = m.render().unwrap();
        assert!(text.contains("termnet_requests_received_total 1"));
        assert!(text.contains(r#"termnet_responses_sent_total{code="503"} 1"#));
        assert!(text.contains("# TYPE termnet_frames_sent_total counter"));
    }

    #[test]
    fn terminals_do_not_share_counters() {
        let a = Metrics::default();
        let b = Metrics::default();
        a.frame_sent();
        assert!(a.render().unwrap().contains("termnet_frames_sent_total 1"));
        assert!(b.render().unwrap().contains("termnet_frames_sent_total 0"));
    }
}
