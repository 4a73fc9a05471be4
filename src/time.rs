//! Wall clock provisioning codes.
//!
//! A QR code whose plaintext is `YYYY-MM-DD-HH-MM` (UTC) sets the device clock.

use chrono::NaiveDate;

/// Parse `YYYY-MM-DD-HH-MM` into Unix seconds. Returns `None` for any other
/// shape, an invalid date or time, or a moment outside the `u32` epoch range.
pub fn parse_clock_code(text: &[u8]) -> Option<u32> {
    if text.len() != 16 {
        return None;
    }
    for &i in &[4usize, 7, 10, 13] {
        if text[i] != b'-' {
            return None;
        }
    }
    let year = digits(&text[0..4])?;
    let month = digits(&text[5..7])?;
    let day = digits(&text[8..10])?;
    let hour = digits(&text[11..13])?;
    let minute = digits(&text[14..16])?;

    let seconds = NaiveDate::from_ymd_opt(year as i32, month, day)?
        .and_hms_opt(hour, minute, 0)?
        .and_utc()
        .timestamp();
    u32::try_from(seconds).ok()
}

fn digits(field: &[u8]) -> Option<u32> {
    field.iter().try_fold(0u32, |acc, &b| {
        b.is_ascii_digit().then(|| acc * 10 + (b - b'0') as u32)
    })
}
