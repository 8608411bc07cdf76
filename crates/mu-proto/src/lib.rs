pub mod config;
pub mod native;
pub mod params;
pub mod platform;
pub mod protocol;
