use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub frames_received_total: IntCounterVec,
    pub frames_dropped_total: IntCounterVec,
    pub outbound_frames_total: IntCounterVec,
    pub lifecycle_events_total: IntCounterVec,
    pub offers_active: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let frames_received_total = IntCounterVec::new(
            Opts::new("frames_received_total", "Inbound frames accepted by type"),
            &["type"],
        )?;

        let frames_dropped_total = IntCounterVec::new(
            Opts::new("frames_dropped_total", "Inbound frames dropped by reason"),
            &["reason"],
        )?;

        let outbound_frames_total = IntCounterVec::new(
            Opts::new("outbound_frames_total", "Outbound frames by type and outcome"),
            &["type", "outcome"],
        )?;

        let lifecycle_events_total = IntCounterVec::new(
            Opts::new("lifecycle_events_total", "Ride lifecycle events emitted"),
            &["event"],
        )?;

        let offers_active = IntGauge::new("offers_active", "Ride offers currently in the registry")?;

        registry.register(Box::new(frames_received_total.clone()))?;
        registry.register(Box::new(frames_dropped_total.clone()))?;
        registry.register(Box::new(outbound_frames_total.clone()))?;
        registry.register(Box::new(lifecycle_events_total.clone()))?;
        registry.register(Box::new(offers_active.clone()))?;

        Ok(Self {
            registry,
            frames_received_total,
            frames_dropped_total,
            outbound_frames_total,
            lifecycle_events_total,
            offers_active,
        })
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
