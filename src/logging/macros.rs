// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logging macros for convenient logging

/// Log a message with critical severity
///
/// # Examples
/// ```ignore
/// log_critical!(logger, Facility::Timers, "stale timer fired twice");
/// ```
#[macro_export]
macro_rules! log_critical {
    ($logger:expr, $facility:expr, $msg:expr) => {
        $logger.critical($facility, $msg)
    };
    ($logger:expr, $facility:expr, $fmt:expr, $($arg:tt)+) => {
        $logger.critical($facility, &format!($fmt, $($arg)+))
    };
}

/// Log a message with error severity
#[macro_export]
macro_rules! log_error {
    ($logger:expr, $facility:expr, $msg:expr) => {
        $logger.error($facility, $msg)
    };
    ($logger:expr, $facility:expr, $fmt:expr, $($arg:tt)+) => {
        $logger.error($facility, &format!($fmt, $($arg)+))
    };
}

/// Log a message with warning severity
#[macro_export]
macro_rules! log_warning {
    ($logger:expr, $facility:expr, $msg:expr) => {
        $logger.warning($facility, $msg)
    };
    ($logger:expr, $facility:expr, $fmt:expr, $($arg:tt)+) => {
        $logger.warning($facility, &format!($fmt, $($arg)+))
    };
}

/// Log a message with notice severity
#[macro_export]
macro_rules! log_notice {
    ($logger:expr, $facility:expr, $msg:expr) => {
        $logger.notice($facility, $msg)
    };
    ($logger:expr, $facility:expr, $fmt:expr, $($arg:tt)+) => {
        $logger.notice($facility, &format!($fmt, $($arg)+))
    };
}

/// Log a message with info severity
#[macro_export]
macro_rules! log_info {
    ($logger:expr, $facility:expr, $msg:expr) => {
        $logger.info($facility, $msg)
    };
    ($logger:expr, $facility:expr, $fmt:expr, $($arg:tt)+) => {
        $logger.info($facility, &format!($fmt, $($arg)+))
    };
}

/// Log a message with debug severity
#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $facility:expr, $msg:expr) => {
        $logger.debug($facility, $msg)
    };
    ($logger:expr, $facility:expr, $fmt:expr, $($arg:tt)+) => {
        $logger.debug($facility, &format!($fmt, $($arg)+))
    };
}
