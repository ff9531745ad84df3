pub mod prelude;

pub mod hash_blacklist;
pub mod scan_logs;
pub mod stored_files;
