#![forbid(unsafe_code)]

pub mod history;
pub mod loader;
pub mod manager;
pub mod model;
pub mod params;
pub mod runner;
