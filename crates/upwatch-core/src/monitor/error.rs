use thiserror::Error;

use crate::storage::StorageError;

/// A monitor iteration that could not persist its outage transition.
///
/// The tracker is left unchanged, so the next qualifying check retries.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("service '{service}': failed to open outage: {source}")]
    OpenOutage {
        service: String,
        #[source]
        source: StorageError,
    },
    #[error("service '{service}': failed to close outage {outage_id}: {source}")]
    CloseOutage {
        service: String,
        outage_id: i64,
        #[source]
        source: StorageError,
    },
}
