pub mod availability;
pub mod booking;
pub mod catalog;
pub mod config;
pub mod limits;
pub mod model;
pub mod observability;
pub mod policy;
pub mod reaper;
pub mod store;
pub mod wal;
pub mod wire;
