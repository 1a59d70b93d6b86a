// Public API - the runner entry points and the error types they surface
pub mod error;
pub mod runner;

// Internal modules - organized by subsystem
mod config;
mod coordination;
mod db;
mod download;
mod formats;
mod http;
mod io;
mod telemetry;
