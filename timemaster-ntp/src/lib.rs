//! # Timemaster NTP
//!
//! Network time for the election. [`SntpTimeSource`] queries a list of SNTP
//! servers in order and reports the first valid answer, corrected by the
//! measured clock offset.

pub mod sntp;

pub use sntp::{SntpConfig, SntpTimeSource};
