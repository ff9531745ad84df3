pub mod download;
pub mod health;
pub mod sessions;
pub mod stats;
pub mod upload;
pub mod ws;
