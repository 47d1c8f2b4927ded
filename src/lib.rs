pub mod config;
pub mod events;
pub mod io_helper;
pub mod migration;
pub mod port;
pub mod storage;
pub mod version;
