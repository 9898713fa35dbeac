pub mod intent;
pub mod monitor;
pub mod parser;
pub mod presenter;
pub mod prompts;
pub mod resolver;
pub mod session;
pub mod triggers;
