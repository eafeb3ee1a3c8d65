pub mod backend;
pub mod config;
pub mod error;
pub mod metrics;
pub mod plugin;
pub mod scope;
pub mod script;
pub mod server;
pub mod state;
pub mod stream;
pub mod web;
