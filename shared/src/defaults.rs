//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the
//! configuration structures. These functions are used by serde when
//! deserializing records or settings files that don't specify certain
//! optional fields.

// Analyzer configuration defaults

/// Default bus address of the analyzer (0x10)
pub fn default_bus_addr() -> u16 {
    0x10
}

/// Default reagent consumed by a single test (2 mL)
pub fn default_reagent_use_ml() -> f32 {
    2.0
}

/// Default reagent volume of a full bottle (100 mL)
pub fn default_reagent_start_ml() -> f32 {
    100.0
}

/// Default waste tank capacity before tests are blocked (500 mL)
pub fn default_waste_threshold_ml() -> f32 {
    500.0
}

// Controller settings defaults

/// Default HTTP listen address
pub fn default_listen_address() -> String {
    "127.0.0.1:8080".to_string()
}

/// Default data directory for the on-disk store
pub fn default_data_dir() -> String {
    "./data".to_string()
}

/// Default I2C character device path
pub fn default_bus_device() -> String {
    "/dev/i2c-1".to_string()
}

/// Default SQLite database busy timeout (5 seconds)
pub fn default_database_busy_timeout() -> u64 {
    5
}

/// Default WAL checkpoint interval (3600 seconds / 1 hour)
pub fn default_wal_checkpoint_interval() -> u64 {
    3600
}

/// Default graceful shutdown timeout (30 seconds)
pub fn default_graceful_shutdown_timeout() -> u64 {
    30
}

/// Default status poll interval while a device action runs (500 ms)
pub fn default_poll_interval_ms() -> u64 {
    500
}

/// Default ceiling on a single device action (300 seconds / 5 minutes)
pub fn default_poll_timeout_seconds() -> u64 {
    300
}

/// Default settle delay before reading a calibration factor back (100 ms)
pub fn default_settle_delay_ms() -> u64 {
    100
}

/// Default capacity of the in-memory activity log ring
pub fn default_activity_capacity() -> usize {
    100
}
