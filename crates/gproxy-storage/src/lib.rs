pub mod db;
pub mod entities;
pub mod seaorm;
pub mod sinks;
pub mod snapshot;
pub mod storage;

pub use seaorm::SeaOrmStorage;
pub use sinks::DbEventSink;
pub use snapshot::StorageSnapshot;
pub use storage::{
    LogQueryFilter, LogQueryResult, LogRecord, LogRecordKind, MessageRequestOutcome,
    ProviderChainItemInput, Storage, StorageError, StorageResult, UsageAggregate,
    UsageAggregateFilter,
};
