pub mod interval;
pub mod segment;

pub use interval::AppIntervalRecord;
pub use segment::{SegmentRecord, StoreStats};

use rand::Rng;

/// Generates a record id: 10 random bytes as 20 lowercase hex chars.
pub fn generate_record_id() -> String {
    let mut bytes = [0u8; 10];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_ids_are_20_hex_chars_and_unique() {
        let a = generate_record_id();
        let b = generate_record_id();
        assert_eq!(a.len(), 20);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
