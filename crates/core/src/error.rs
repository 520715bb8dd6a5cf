use thiserror::Error;

#[derive(Error, Debug)]
pub enum PvError {
    #[error("invalid active channels: {0}")]
    InvalidChannels(String),

    #[error("unknown grouping topology: {0}")]
    UnknownGrouping(String),

    #[error("unknown rule type: {0}")]
    UnknownRuleType(String),

    #[error("unknown severity: {0}")]
    UnknownSeverity(String),

    #[error("unknown vendor kind: {0}")]
    UnknownVendorKind(String),
}
