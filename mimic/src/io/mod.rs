//! I/O helpers: child processes, the core adapter, config and artifacts.

pub mod artifact;
pub mod attempt_log;
pub mod cancel;
pub mod config;
pub mod invoker;
pub mod process;
