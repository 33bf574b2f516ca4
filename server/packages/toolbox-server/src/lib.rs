//! HTTP front end for the toolbox job runner.

pub mod cli;
pub mod router;
pub mod server_logs;
pub mod ui;
