pub mod completion;
pub mod dispatch;
pub mod history;
pub mod models;
pub mod pending;
pub mod scripts;
pub mod secrets;
pub mod store;
pub mod transport;

pub use completion::{CompletionRouter, CompletionSignal};
pub use dispatch::{DispatchError, Dispatcher};
pub use history::CommandHistory;
pub use models::*;
pub use pending::PendingTracker;
pub use secrets::SecretStore;
pub use store::ServerStore;
pub use transport::{SshTransport, Transport};

#[cfg(test)]
mod store_test;
