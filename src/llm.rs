//! Generation dispatch: chat-completion client, worker pool, dispatcher.

pub mod client;
pub mod dispatcher;
pub mod pool;

pub use client::ChatClient;
pub use dispatcher::Dispatcher;
pub use pool::WorkerPool;
