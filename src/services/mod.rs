pub mod claimer;
pub mod invoker;
pub mod materializer;
pub mod memory_store;
pub mod poller;
pub mod publisher;
pub mod recovery;
pub mod retry;
pub mod storage;
