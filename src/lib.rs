pub mod cache;
pub mod cli;
pub mod completion;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod diff;
pub mod error;
pub mod fingerprint;
pub mod pipeline;
pub mod pool;
pub mod process;
pub mod prompts;
pub mod resolver;
pub mod review_schema;
pub mod state;
pub mod tasks;

#[cfg(test)]
mod test_helpers;
