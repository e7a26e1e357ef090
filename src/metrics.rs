use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::info::Info;
use prometheus_client::registry::Registry;

use crate::pipeline::ErrorContext;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    kind: String,
}

lazy_static::lazy_static! {
    pub static ref QUERIES_DISPATCHED: Counter = Default::default();
    pub static ref QUERIES_FAILED: Counter = Default::default();
    pub static ref RANGES_COVERED: Counter = Default::default();
    pub static ref RANGES_REQUEUED: Counter = Default::default();
    pub static ref RECORDS_LOADED: Counter = Default::default();
    pub static ref RECORDS_FAILED: Counter = Default::default();
    pub static ref CYCLES_COMPLETED: Counter = Default::default();
    pub static ref PRODUCTS_IN_LAST_CYCLE: Gauge = Default::default();
    pub static ref SNAPSHOTS_STORED: Counter = Default::default();
    static ref ERRORS: Family<ErrorLabels, Counter> = Default::default();
}

pub fn report_error(context: &ErrorContext) {
    let kind = match context {
        ErrorContext::Query { .. } => "query",
        ErrorContext::Record { .. } => "record",
        ErrorContext::ImportState { .. } => "import_state",
        ErrorContext::Snapshot { .. } => "snapshot",
    };
    ERRORS
        .get_or_create(&ErrorLabels {
            kind: kind.to_owned(),
        })
        .inc();
}

pub fn register_metrics(registry: &mut Registry, info: Info<Vec<(String, String)>>) {
    registry.register("importer_info", "Importer info", info);
    registry.register(
        "num_queries_dispatched",
        "Number of transfer queries sent to the RPC",
        QUERIES_DISPATCHED.clone(),
    );
    registry.register(
        "num_queries_failed",
        "Number of transfer queries which failed",
        QUERIES_FAILED.clone(),
    );
    registry.register(
        "num_ranges_covered",
        "Number of block ranges marked as imported",
        RANGES_COVERED.clone(),
    );
    registry.register(
        "num_ranges_requeued",
        "Number of block ranges scheduled for a retry",
        RANGES_REQUEUED.clone(),
    );
    registry.register(
        "num_records_loaded",
        "Number of investment records stored",
        RECORDS_LOADED.clone(),
    );
    registry.register(
        "num_records_failed",
        "Number of investment records which couldn't be stored",
        RECORDS_FAILED.clone(),
    );
    registry.register(
        "num_cycles_completed",
        "Number of finished import cycles",
        CYCLES_COMPLETED.clone(),
    );
    registry.register(
        "products_in_last_cycle",
        "Number of products processed by the last cycle",
        PRODUCTS_IN_LAST_CYCLE.clone(),
    );
    registry.register(
        "num_snapshots_stored",
        "Number of share rate snapshots stored",
        SNAPSHOTS_STORED.clone(),
    );
    registry.register("num_errors", "Number of reported errors", ERRORS.clone());
}
