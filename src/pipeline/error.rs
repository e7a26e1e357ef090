use std::fmt;

use chrono::{DateTime, Utc};
use ethers::types::H256;
use tracing::error;

use crate::{
    metrics,
    optimizer::OptimizeError,
    types::{product::ProductKey, range::BlockNumber, range::Range},
};

/// Remote calls that may succeed when tried again later.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Remote source unavailable: {0}")]
    Unavailable(String),
    #[error("Archive node needed to read block {0}")]
    ArchiveNodeNeeded(BlockNumber),
    #[error("Request timed out")]
    Timeout,
    #[error("RPC error: {0}")]
    Rpc(String),
}

/// Failure to load a single record.
#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("Couldn't fetch transfer data: {0}")]
    Fetch(#[from] FetchError),
    #[error("Couldn't convert {value} with {decimals} decimals")]
    Conversion { value: String, decimals: u32 },
    #[error("Couldn't store record: {0:#}")]
    Store(anyhow::Error),
}

/// Errors that abort the whole cycle.
#[derive(thiserror::Error, Debug)]
pub enum ImportError {
    #[error(transparent)]
    Optimize(#[from] OptimizeError),
    #[error("Couldn't get the latest block: {0}")]
    Frontier(FetchError),
}

/// Where a reported error happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorContext {
    Query {
        product_key: ProductKey,
        range: Range<BlockNumber>,
    },
    Record {
        product_key: ProductKey,
        block_number: BlockNumber,
        transaction_hash: H256,
    },
    ImportState {
        product_key: ProductKey,
    },
    Snapshot {
        product_key: ProductKey,
        range: Range<DateTime<Utc>>,
    },
}

impl ErrorContext {
    pub fn product_key(&self) -> &ProductKey {
        match self {
            ErrorContext::Query { product_key, .. }
            | ErrorContext::Record { product_key, .. }
            | ErrorContext::ImportState { product_key }
            | ErrorContext::Snapshot { product_key, .. } => product_key,
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorContext::Query { product_key, range } => {
                write!(f, "query {range} of {product_key}")
            }
            ErrorContext::Record {
                product_key,
                block_number,
                transaction_hash,
            } => write!(
                f,
                "record {transaction_hash:?} at block {block_number} of {product_key}"
            ),
            ErrorContext::ImportState { product_key } => {
                write!(f, "import state of {product_key}")
            }
            ErrorContext::Snapshot { product_key, range } => {
                write!(f, "snapshot {range} of {product_key}")
            }
        }
    }
}

/// Receives failures for visibility only. Must never fail itself.
pub trait ErrorSink: Send + Sync {
    fn report(&self, context: &ErrorContext, error: &(dyn std::error::Error + Send + Sync));
}

#[derive(Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, context: &ErrorContext, error: &(dyn std::error::Error + Send + Sync)) {
        metrics::report_error(context);
        error!(product_key = %context.product_key(), "Error in {context}: {error}");
    }
}

#[cfg(test)]
pub mod tests {
    use parking_lot::Mutex;

    use super::*;

    /// Keeps every report for later inspection.
    #[derive(Default)]
    pub struct CollectingErrorSink {
        pub reports: Mutex<Vec<(ErrorContext, String)>>,
    }

    impl ErrorSink for CollectingErrorSink {
        fn report(&self, context: &ErrorContext, error: &(dyn std::error::Error + Send + Sync)) {
            self.reports.lock().push((context.clone(), error.to_string()));
        }
    }

    #[test]
    fn test_context_display() {
        let context = ErrorContext::Query {
            product_key: "p".to_owned(),
            range: Range::new(1, 2).unwrap(),
        };
        assert_eq!(context.to_string(), "query [1, 2] of p");
        assert_eq!(context.product_key(), "p");

        let sink = CollectingErrorSink::default();
        sink.report(&context, &FetchError::Timeout);
        assert_eq!(
            sink.reports.lock().as_slice(),
            &[(context, "Request timed out".to_owned())]
        );
    }
}
