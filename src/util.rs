use std::ascii;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn bytes_to_human_str(input: &[u8]) -> String {
    String::from_utf8(
        input
            .iter()
            .flat_map(|&c| ascii::escape_default(c))
            .collect::<Vec<u8>>(),
    )
    .unwrap()
}

/// Current unix time, clamped into the u32 range the record format carries.
pub fn now_unix() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}
