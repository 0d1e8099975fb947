pub mod amount;
pub mod classifier;
pub mod config;
pub mod enumerator;
pub mod error;
pub mod rebuild;
pub mod retry;
pub mod rpc;
pub mod scheduler;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_support;

pub use amount::*;
pub use classifier::*;
pub use crate::config::*;
pub use enumerator::*;
pub use error::*;
pub use rebuild::*;
pub use retry::*;
pub use rpc::*;
pub use scheduler::*;
pub use store::*;
pub use types::*;
