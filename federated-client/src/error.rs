use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Failed to read route table {path}: {message}")]
    Read { path: String, message: String },

    #[error("Invalid route table: {0}")]
    Parse(String),

    #[error("Invalid route for party {party_id}: {message}")]
    InvalidRoute { party_id: String, message: String },

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

pub type Result<T> = std::result::Result<T, RouteError>;
