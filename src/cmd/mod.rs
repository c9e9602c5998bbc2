//! CLI command implementations.
//!
//! | Module   | Commands handled              |
//! |----------|-------------------------------|
//! | `run`    | `Run`                         |
//! | `probe`  | `Probe`                       |
//! | `config` | `Config`                      |
//! | `status` | `Status`                      |

pub mod config;
pub mod probe;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use probe::cmd_probe;
pub use run::{RunOptions, cmd_run};
pub use status::cmd_status;
