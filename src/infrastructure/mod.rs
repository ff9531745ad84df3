pub mod database;
pub mod scanner;
pub mod storage;
