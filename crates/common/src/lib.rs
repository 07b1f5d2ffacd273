mod error;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Whether the process is running in development mode (`APP_ENV=dev`).
///
/// Dev mode switches logging to verbose console output, shortens the agent's
/// shutdown timer, and forces agent redeployment on every connect.
pub fn is_dev() -> bool {
    std::env::var("APP_ENV").map(|v| v == "dev").unwrap_or(false)
}
