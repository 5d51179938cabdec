// src/macros.rs

//
// Logging macros
//
// logging feature enabled → tracing
// logging feature disabled → only log_error prints to stderr
//
// Two call forms are accepted:
//
//   log_info!("plain {message}");
//   log_info!(self.id => "consuming {topic}");   // prints "[<id>] consuming ..."
//
// Buses and brokers use the second form so interleaved output from several
// bus instances in one process stays attributable.
//

#![allow(unused_macros)]

// --------------------
// ERROR
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_error {
    ($id:expr => $($arg:tt)*) => {
        tracing::error!("[{}] {}", $id, format_args!($($arg)*))
    };
    ($($arg:tt)*) => {
        tracing::error!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_error {
    ($id:expr => $($arg:tt)*) => {
        eprintln!("[{}] {}", $id, format_args!($($arg)*))
    };
    ($($arg:tt)*) => {
        eprintln!($($arg)*)
    };
}

// --------------------
// WARN
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_warn {
    ($id:expr => $($arg:tt)*) => {
        tracing::warn!("[{}] {}", $id, format_args!($($arg)*))
    };
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => {};
}

// --------------------
// INFO
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_info {
    ($id:expr => $($arg:tt)*) => {
        tracing::info!("[{}] {}", $id, format_args!($($arg)*))
    };
    ($($arg:tt)*) => {
        tracing::info!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_info {
    ($($arg:tt)*) => {};
}

// --------------------
// DEBUG
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_debug {
    ($id:expr => $($arg:tt)*) => {
        tracing::debug!("[{}] {}", $id, format_args!($($arg)*))
    };
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => {};
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
