//! Turning materialized post containers into typed records.

mod engine;
mod ids;
mod record;
mod timestamp;

pub use engine::{ExtractionPass, Extractor};
pub use ids::{content_key, derive_source_id, fallback_source_id};
pub use record::{RawRecord, RecordField, RecordKind};
pub use timestamp::normalize_timestamp;
