use iroh_metrics::{Counter, MetricsGroup};

/// Metrics tracked by a node.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "latticedb")]
pub struct Metrics {
    /*
     * Engine commands
     */
    /// Select queries evaluated.
    pub queries: Counter,
    /// Join queries applied to the working namespace.
    pub joins: Counter,
    /// Reflection requests answered.
    pub reflections: Counter,
    /// Replicate commands that joined a remote index.
    pub replications: Counter,
    /// Replicated links dropped for failing verification or fetch.
    pub links_dropped: Counter,
    /// Pubsub records that did not decode as a link.
    pub records_malformed: Counter,

    /*
     * Persistence
     */
    /// Persist cycles started.
    pub persist_cycles: Counter,
    /// Persist cycles that failed before the head was swapped.
    pub persist_failures: Counter,
    /// Head links published to topics.
    pub publishes: Counter,
    /// Publishes that failed.
    pub publish_failures: Counter,

    /*
     * Content
     */
    /// Namespace fragments fetched for selects and dumps.
    pub fragment_fetches: Counter,
    /// Fragment fetches that failed.
    pub fragment_failures: Counter,
    /// Lookups answered by the cache.
    pub cache_hits: Counter,
    /// Lookups that went to the peer.
    pub cache_misses: Counter,
    /// Decoded sub-entries that were dropped.
    #[metrics(help = "Number of invalid entries skipped while decoding.")]
    pub invalid_entries: Counter,

    /*
     * Request service
     */
    /// Requests accepted into the queue.
    pub requests_accepted: Counter,
    /// Requests rejected because the queue was full.
    pub requests_rejected: Counter,
    /// Requests abandoned after their deadline.
    pub requests_timed_out: Counter,
}
