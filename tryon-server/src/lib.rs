//! HTTP front end of the virtual try-on service.

pub mod error;
pub mod form;
pub mod handlers;
pub mod lifecycle;
pub mod routes;
pub mod settings;
pub mod state;
pub mod telemetry;

pub use error::AppError;
pub use routes::create_router;
pub use settings::Settings;
pub use state::AppState;
