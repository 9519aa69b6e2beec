// genopt_core/src/lib.rs

pub mod event;
pub mod utils;
pub mod schema;
pub mod worker;
pub mod plugins;
pub mod strategy;
pub mod settings;
pub mod backtest;
pub mod execution;
pub mod indicators;
pub mod data_handler;
pub mod optimization;
pub mod walk_forward;
pub mod instruments_info;
