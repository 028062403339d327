pub mod collector;
pub mod device_table;
pub mod record_log;
pub mod sequence_tracker;
pub mod session;
