use tracing::info;

pub(crate) struct Metric {
    pub name: &'static str,
    description: &'static str,
}

pub(crate) const COUNTERS: [Metric; 7] = [
    TOPIC_MESSAGES_IN_TOTAL,
    TOPIC_BYTES_IN_TOTAL,
    TOPIC_PUBLISH_DUPLICATES_TOTAL,
    TOPIC_PUBLISH_FAILURES_TOTAL,
    TOPICS_GC_DELETED_TOTAL,
    COMPACTION_RUNS_TOTAL,
    COMPACTION_FAILED_TOTAL,
];
pub(crate) const GAUGES: [Metric; 3] = [
    TOPIC_ACTIVE_PRODUCERS,
    TOPIC_ACTIVE_SUBSCRIPTIONS,
    TOPIC_ACTIVE_REPLICATORS,
];

// TOPIC Metrics --------------------------

pub(crate) const TOPIC_MESSAGES_IN_TOTAL: Metric = Metric {
    name: "siret_topic_messages_in_total",
    description: "Total messages persisted to the topic (msg).",
};

pub(crate) const TOPIC_BYTES_IN_TOTAL: Metric = Metric {
    name: "siret_topic_bytes_in_total",
    description: "Total bytes persisted to the topic (bytes)",
};

pub(crate) const TOPIC_PUBLISH_DUPLICATES_TOTAL: Metric = Metric {
    name: "siret_topic_publish_duplicates_total",
    description: "Total publishes acknowledged as duplicates without a new append",
};

pub(crate) const TOPIC_PUBLISH_FAILURES_TOTAL: Metric = Metric {
    name: "siret_topic_publish_failures_total",
    description: "Total publishes that failed at the ordered log",
};

pub(crate) const TOPIC_ACTIVE_PRODUCERS: Metric = Metric {
    name: "siret_topic_active_producers",
    description: "Total number of producers per topic",
};

pub(crate) const TOPIC_ACTIVE_SUBSCRIPTIONS: Metric = Metric {
    name: "siret_topic_active_subscriptions",
    description: "Total number of subscriptions per topic",
};

pub(crate) const TOPIC_ACTIVE_REPLICATORS: Metric = Metric {
    name: "siret_topic_active_replicators",
    description: "Total number of live replicators per topic",
};

pub(crate) const TOPICS_GC_DELETED_TOTAL: Metric = Metric {
    name: "siret_topics_gc_deleted_total",
    description: "Total number of inactive topics deleted by garbage collection",
};

// COMPACTION Metrics --------------------------

pub(crate) const COMPACTION_RUNS_TOTAL: Metric = Metric {
    name: "siret_compaction_runs_total",
    description: "Total number of completed compaction runs",
};

pub(crate) const COMPACTION_FAILED_TOTAL: Metric = Metric {
    name: "siret_compaction_failed_total",
    description: "Total number of failed compaction runs",
};

/// Describe and pre-register every metric the engine emits. The host is
/// responsible for installing a recorder/exporter before calling this.
pub fn init_metrics() {
    info!("registering topic engine metrics");

    for metric in COUNTERS {
        register_counter(metric)
    }

    for metric in GAUGES {
        register_gauge(metric)
    }
}

/// Registers a counter with the given name.
fn register_counter(metric: Metric) {
    metrics::describe_counter!(metric.name, metric.description);
    let _counter = metrics::counter!(metric.name);
}

/// Registers a gauge with the given name.
fn register_gauge(metric: Metric) {
    metrics::describe_gauge!(metric.name, metric.description);
    let _gauge = metrics::gauge!(metric.name);
}
