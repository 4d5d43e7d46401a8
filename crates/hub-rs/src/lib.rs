pub mod config;
pub mod data_proxy;
pub mod hub;
pub mod logging;
pub mod pending;
pub mod process;
pub mod registry;
pub mod tunnel;
pub mod ui_manager;
pub mod wire;
