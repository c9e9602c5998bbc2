pub mod audit;
pub mod config;
pub mod errors;
pub mod gear;
pub mod governor;
pub mod lock;
pub mod logging;
pub mod monitor;
pub mod orchestrator;
pub mod recovery;
pub mod supervisor;
pub mod ui;
