//! Human-readable byte counts for the cache maintenance endpoints.

const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

pub fn human_bytes(size: u64) -> String {
    let mut value = size as f64;
    let mut idx = 0;
    while value >= 1024.0 && idx < UNITS.len() - 1 {
        value /= 1024.0;
        idx += 1;
    }
    if idx == 0 {
        format!("{size} {}", UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_stay_integral() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(1023), "1023 B");
    }

    #[test]
    fn larger_sizes_use_one_decimal() {
        assert_eq!(human_bytes(1024), "1.0 KB");
        assert_eq!(human_bytes(1536), "1.5 KB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn huge_sizes_cap_at_terabytes() {
        assert_eq!(human_bytes(3 * 1024u64.pow(4)), "3.0 TB");
        assert_eq!(human_bytes(2048 * 1024u64.pow(4)), "2048.0 TB");
    }
}
