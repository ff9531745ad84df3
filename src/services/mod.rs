pub mod blacklist;
pub mod error;
pub mod finalizer;
pub mod hasher;
pub mod pipeline;
pub mod progress;
pub mod reputation;
pub mod scan_log;
pub mod scanner;
pub mod session;
pub mod storage;
pub mod verdict;
pub mod worker;
