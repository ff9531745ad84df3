pub use super::hash_blacklist::Entity as HashBlacklist;
pub use super::scan_logs::Entity as ScanLogs;
pub use super::stored_files::Entity as StoredFiles;
