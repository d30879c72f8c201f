#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod bot;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod gate;
pub mod logging;
pub mod membership;
pub mod storage;
pub mod target;
pub mod telegram;
pub mod transport;
pub mod visibility;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
