use shared::metrics_defs::{MetricDef, MetricType};

pub const SESSIONS_ACTIVE: MetricDef = MetricDef {
    name: "streamer.sessions.active",
    metric_type: MetricType::Gauge,
    description: "Channel sessions currently held by the registry",
};

pub const ATTACHMENTS_ACTIVE: MetricDef = MetricDef {
    name: "streamer.attachments.active",
    metric_type: MetricType::Gauge,
    description: "Clients currently attached to a channel session",
};

pub const UPSTREAM_CONNECTS: MetricDef = MetricDef {
    name: "streamer.upstream.connects",
    metric_type: MetricType::Counter,
    description: "Successful upstream connections",
};

pub const UPSTREAM_CONNECT_FAILURES: MetricDef = MetricDef {
    name: "streamer.upstream.connect_failures",
    metric_type: MetricType::Counter,
    description: "Failed upstream connection attempts, one per candidate tried",
};

pub const UPSTREAM_READ_FAILURES: MetricDef = MetricDef {
    name: "streamer.upstream.read_failures",
    metric_type: MetricType::Counter,
    description: "Connected upstreams that stopped delivering data",
};

pub const FAILOVER_PASSES: MetricDef = MetricDef {
    name: "streamer.failover.passes",
    metric_type: MetricType::Counter,
    description: "Full passes over a candidate list without a successful connect",
};

pub const SOURCES_EXHAUSTED: MetricDef = MetricDef {
    name: "streamer.sources.exhausted",
    metric_type: MetricType::Counter,
    description: "Sessions that gave up on every source and disconnected their clients",
};

pub const SLOW_CLIENTS_DROPPED: MetricDef = MetricDef {
    name: "streamer.clients.slow_dropped",
    metric_type: MetricType::Counter,
    description: "Clients dropped because their buffer was full",
};

pub const ADMISSION_DENIED: MetricDef = MetricDef {
    name: "streamer.admission.denied",
    metric_type: MetricType::Counter,
    description: "Rejected client requests. Tagged with reason (channel, global).",
};

pub const BYTES_RELAYED: MetricDef = MetricDef {
    name: "streamer.bytes.relayed",
    metric_type: MetricType::Counter,
    description: "Bytes read from upstreams and offered to clients",
};

pub const ALL_METRICS: &[MetricDef] = &[
    SESSIONS_ACTIVE,
    ATTACHMENTS_ACTIVE,
    UPSTREAM_CONNECTS,
    UPSTREAM_CONNECT_FAILURES,
    UPSTREAM_READ_FAILURES,
    FAILOVER_PASSES,
    SOURCES_EXHAUSTED,
    SLOW_CLIENTS_DROPPED,
    ADMISSION_DENIED,
    BYTES_RELAYED,
];
