pub mod browser;
pub mod config;
pub mod db;
pub mod distance;
pub mod geo;
pub mod handlers;
pub mod import;
pub mod mirror;
pub mod model;
pub mod prefs;
pub mod protheus;
pub mod retry;
pub mod sync;
pub mod tasks;
pub mod telegram;
