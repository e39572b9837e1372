//! Shared types for the stowaway session manager.

pub mod config;

pub use config::{
    ConfigProvider, HasPersistenceConfig, PersistenceConfigProvider, defaults as config_defaults,
    secs_threshold,
};
