mod bridge;
mod cli;
mod config;
mod context;
mod data_io;
mod error;
mod logging;
mod mitigation;
mod navigation;
mod orchestrator;
mod runtime;
mod state;
mod store;
#[cfg(test)]
mod testing;
mod types;
mod urls;
mod watchdog;
mod webdriver;

pub use runtime::run;
