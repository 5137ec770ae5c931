//! Configuration: tracker settings (TOML + env secrets) and the watchlist.

pub mod tracker;
pub mod watchlist;

pub use tracker::{
    ApiConfig, EmailConfig, EngineConfig, IcalConfig, LogFormat, LoggingConfig, NotifyConfig,
    ProviderConfig, PushoverConfig, RetentionConfig, StoreConfig, TrackerConfig,
    WebhookChannelConfig,
};
pub use watchlist::{load_watchlist_default, load_watchlist_from, WatchEntry};
