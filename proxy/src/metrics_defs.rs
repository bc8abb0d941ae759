use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUESTS: MetricDef = MetricDef {
    name: "proxy.requests",
    metric_type: MetricType::Counter,
    description: "Handled requests. Tagged with route, status.",
};

pub const STREAM_DURATION: MetricDef = MetricDef {
    name: "proxy.stream.duration",
    metric_type: MetricType::Histogram,
    description: "Seconds a client stayed attached to a channel. Tagged with end reason.",
};

pub const CONFIG_RELOADS: MetricDef = MetricDef {
    name: "proxy.config.reloads",
    metric_type: MetricType::Counter,
    description: "Applied configuration reloads",
};

pub const ALL_METRICS: &[MetricDef] = &[REQUESTS, STREAM_DURATION, CONFIG_RELOADS];
