//! Catchable error conditions for the pipeline.
//!
//! Most failures travel as plain `anyhow` errors. The conditions below are the
//! ones callers need to recognize — the CLI downcasts them to print a
//! remediation command instead of a bare error chain.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Cached or cleaned data was requested for a year that was never
    /// downloaded or cleaned. The dominant expected error.
    #[error("no {kind} data found for {year}: {hint}")]
    MissingData {
        kind: &'static str,
        year: u16,
        hint: String,
    },

    /// No download URL is configured for the requested year. A foreseeable
    /// operator mistake, reported rather than panicked on.
    #[error("no rent data URL configured for {0}; add it to config_urls.json")]
    NoUrlConfigured(u16),

    /// Every candidate text encoding failed to decode the input file.
    #[error("could not decode {path} with any of: {tried}")]
    EncodingExhausted { path: String, tried: String },

    /// A required column is entirely absent from the input table. An
    /// input-contract violation the caller must prevent.
    #[error("required column missing from input: {0}")]
    MissingColumn(&'static str),
}

impl PipelineError {
    pub fn missing_data(kind: &'static str, year: u16, hint: impl Into<String>) -> Self {
        PipelineError::MissingData {
            kind,
            year,
            hint: hint.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_data_is_downcastable_through_anyhow() {
        let err: anyhow::Error =
            PipelineError::missing_data("DVF", 2023, "run download first").into();

        let recovered = err.downcast_ref::<PipelineError>();
        assert!(matches!(
            recovered,
            Some(PipelineError::MissingData { year: 2023, .. })
        ));
    }

    #[test]
    fn test_display_carries_the_hint() {
        let err = PipelineError::missing_data("DVF", 2023, "run download first");
        let msg = err.to_string();
        assert!(msg.contains("2023"));
        assert!(msg.contains("run download first"));
    }
}
