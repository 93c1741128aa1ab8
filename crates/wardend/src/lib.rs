//! wardend - self-healing service supervisor
//!
//! Library half of the daemon. The binary only parses flags, sets up
//! logging and hands the loaded configuration to [`daemon::run`].

pub mod battery;
pub mod bus;
pub mod config;
pub mod daemon;
pub mod exec;
pub mod health;
pub mod monitor;
pub mod schedule;
pub mod supervisor;
pub mod wakelock;

pub use bus::{handler, EventBus, Handler};
pub use config::ConfigStore;
pub use daemon::Warden;
