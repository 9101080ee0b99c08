pub mod auth;
pub mod config;
pub mod content;
pub mod gate;
pub mod model;
pub mod shell;
pub mod store;
