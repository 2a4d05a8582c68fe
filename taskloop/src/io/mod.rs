pub mod bridge;
pub mod command_oracle;
pub mod config;
pub mod memory;
pub mod oracle;
pub mod process;
pub mod progress;
pub mod prompt;
pub mod registry;
pub mod run_record;
