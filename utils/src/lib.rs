//! Leverage common ring arithmetic across the simulator crates.

pub mod interval;
pub use interval::{Interval, IntervalSet};
pub mod ring;
pub use ring::{is_ordered, is_ordered_left, is_ordered_open, is_ordered_right};

/// Converts bytes to a hexadecimal string.
pub fn hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes.iter() {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}
