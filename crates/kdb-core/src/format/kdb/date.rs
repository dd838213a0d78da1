//! The packed 5-byte timestamp of KDB v3 records
//!
//! Bit layout, most significant first: year 14, month 4, day 5, hour 5,
//! minute 6, second 6.

use crate::times::never;
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

pub const PACKED_DATE_LEN: usize = 5;

pub fn unpack(b: &[u8; PACKED_DATE_LEN]) -> Option<DateTime<Utc>> {
    let [b0, b1, b2, b3, b4] = b.map(u32::from);
    let year = (b0 << 6) | (b1 >> 2);
    let month = ((b1 & 0x03) << 2) | (b2 >> 6);
    let day = (b2 >> 1) & 0x1F;
    let hour = ((b2 & 0x01) << 4) | (b3 >> 4);
    let minute = ((b3 & 0x0F) << 2) | (b4 >> 6);
    let second = b4 & 0x3F;
    Utc.with_ymd_and_hms(year as i32, month, day, hour, minute, second)
        .single()
}

/// Unpack, reading an invalid date as "never"
pub fn unpack_or_never(b: &[u8; PACKED_DATE_LEN]) -> DateTime<Utc> {
    unpack(b).unwrap_or_else(never)
}

pub fn pack(date: &DateTime<Utc>) -> [u8; PACKED_DATE_LEN] {
    let year = date.year().clamp(0, 0x3FFF) as u32;
    let month = date.month();
    let day = date.day();
    let hour = date.hour();
    let minute = date.minute();
    let second = date.second().min(59);
    [
        ((year >> 6) & 0x3F) as u8,
        (((year & 0x3F) << 2) | ((month >> 2) & 0x03)) as u8,
        (((month & 0x03) << 6) | ((day & 0x1F) << 1) | ((hour >> 4) & 0x01)) as u8,
        (((hour & 0x0F) << 4) | ((minute >> 2) & 0x0F)) as u8,
        (((minute & 0x03) << 6) | (second & 0x3F)) as u8,
    ]
}
