use async_trait::async_trait;
use thiserror::Error;

use super::orchestrator::RunSummary;
use crate::extract::RawRecord;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("sink rejected batch: {0}")]
    Rejected(String),
}

/// Downstream collaborator receiving records in emission order, followed by
/// exactly one run summary.
#[async_trait]
pub trait RecordSink: Send {
    async fn accept(&mut self, batch: Vec<RawRecord>) -> Result<(), SinkError>;

    async fn finish(&mut self, _summary: &RunSummary) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Collects everything in memory.
#[derive(Debug, Default)]
pub struct VecSink {
    pub records: Vec<RawRecord>,
    pub batches: usize,
    pub summary: Option<RunSummary>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordSink for VecSink {
    async fn accept(&mut self, batch: Vec<RawRecord>) -> Result<(), SinkError> {
        self.batches += 1;
        self.records.extend(batch);
        Ok(())
    }

    async fn finish(&mut self, summary: &RunSummary) -> Result<(), SinkError> {
        self.summary = Some(summary.clone());
        Ok(())
    }
}
