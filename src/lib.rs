pub mod config;
pub mod control;
pub mod headers;
pub mod logging;
pub mod models;
pub mod present;
pub mod proxy;
pub mod recorder;
pub mod recording;
pub mod resolver;
pub mod store;
