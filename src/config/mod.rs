//! Configuration and persistence for the wallpaper daemon
//!
//! - **store**: flat persistent key-value store shared by bookmarks and settings
//! - **settings**: typed global settings read from that store

pub mod settings;
pub mod store;

pub use settings::{Settings, SettingsUpdate};
pub use store::{JsonFileStore, KeyValueStore};
