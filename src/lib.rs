mod routes;

pub mod app;
pub mod config;
pub mod gateway;
pub mod payload;
pub mod process_runner;
pub mod records;
pub mod runner;
pub mod server;
pub mod telemetry;

pub use app::start_app;
pub use routes::{ApiError, UserId, USER_HEADER};
