pub mod app;
pub mod cli;

pub use app::SensorApp;
pub use cli::{Cli, Commands};
