#![forbid(unsafe_code)]

pub mod backend;
pub mod generator;
pub mod model;
pub mod queue;
pub mod storage;
