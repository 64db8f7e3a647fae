pub mod automation;
pub mod config;
pub mod flows;
pub mod gateway;
pub mod integrations;
pub mod main_module;
pub mod platform;
pub mod queue;
pub mod shared;
