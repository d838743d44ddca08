//! Application-wide error types.
//!
//! Component errors ([`FactoryError`](crate::factory::FactoryError),
//! [`ServiceError`](crate::service::ServiceError), …) live next to the code
//! that raises them; [`AppError`] is what the binary surfaces.

use thiserror::Error;

use crate::service::ServiceError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
