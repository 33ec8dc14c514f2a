pub mod config;
pub mod events;
pub mod install;
pub mod logs;
pub mod runtime_env;
pub mod server;
pub mod shell;
pub mod utils;
