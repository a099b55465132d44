use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("Flow is closed; segment must start a new flow")]
    FlowClosed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("Connection record {0} is finalized and cannot be modified")]
    Finalized(String),
}
