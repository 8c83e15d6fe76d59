pub mod audio;
pub mod config;
pub mod error;
pub mod export;
pub mod identity;
pub mod job;
pub mod native;
pub mod orchestrator;
pub mod segments;
pub mod store;
pub mod web;

#[cfg(feature = "desktop")]
mod app;
#[cfg(feature = "desktop")]
mod commands;

#[cfg(feature = "desktop")]
pub use app::run;
pub use orchestrator::Orchestrator;
