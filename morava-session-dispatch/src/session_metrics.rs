use metrics::describe_counter;

pub(crate) struct Metric {
    pub name: &'static str,
    description: &'static str,
}

pub(crate) const COUNTERS: [Metric; 4] = [
    SESSION_MESSAGES_OUT_TOTAL,
    SESSION_ACKS_TOTAL,
    SESSION_REDELIVERIES_TOTAL,
    SESSION_DISPATCH_PASSES_TOTAL,
];

// SESSION Metrics --------------------------

pub(crate) const SESSION_MESSAGES_OUT_TOTAL: Metric = Metric {
    name: "morava_session_messages_out_total",
    description: "Total messages handed off to remote session listeners",
};

pub(crate) const SESSION_ACKS_TOTAL: Metric = Metric {
    name: "morava_session_acks_total",
    description: "Total message handles destroyed by acknowledgment",
};

pub(crate) const SESSION_REDELIVERIES_TOTAL: Metric = Metric {
    name: "morava_session_redeliveries_total",
    description: "Total message handles released back for redelivery",
};

pub(crate) const SESSION_DISPATCH_PASSES_TOTAL: Metric = Metric {
    name: "morava_session_dispatch_passes_total",
    description: "Total dispatch passes executed across all sessions",
};

/// Registers descriptions for the session metrics with the installed metrics
/// recorder. Call once at process startup, after the recorder is installed.
pub fn register_metrics() {
    for metric in COUNTERS {
        describe_counter!(metric.name, metric.description);
    }
}
