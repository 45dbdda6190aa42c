pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("Unknown state: {0}")]
    UnknownState(String),

    #[error("Unknown definition: {0}")]
    UnknownDefinition(String),

    #[error("Instance '{0}' already exists")]
    DuplicateInstance(String),

    #[error("Instance has not been started")]
    NotStarted,

    #[error("Expression error: {0}")]
    Expr(String),

    #[error("Action failed: {0}")]
    Action(String),

    #[error("{0}")]
    Other(String),
}
