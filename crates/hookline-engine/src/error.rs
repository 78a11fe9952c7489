use hookline_core::errors::GenerationError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("session aborted")]
    Aborted,

    #[error("no previous request for content type: {0}")]
    NoPreviousRequest(String),
}
