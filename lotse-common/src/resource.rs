//! Parses the Kubernetes metrics API's compact resource-quantity strings
//! into the human-readable units the task info response surfaces.

/// Parses a memory quantity (e.g. `"134217728"`, `"512Ki"`, `"2Gi"`) into a
/// human string such as `"128 MB"` or `"2.00 GB"`.
pub fn parse_memory(resource_str: &str) -> String {
    const UNITS: [(&str, f64); 5] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0f64.powi(3)),
        ("Ti", 1024.0f64.powi(4)),
        ("Pi", 1024.0f64.powi(5)),
    ];

    let mut value = None;
    for (suffix, multiplier) in UNITS {
        if let Some(stripped) = resource_str.strip_suffix(suffix) {
            if let Ok(parsed) = stripped.parse::<f64>() {
                value = Some(parsed * multiplier);
            }
            break;
        }
    }
    let bytes_value = value.unwrap_or_else(|| resource_str.parse::<f64>().unwrap_or(0.0));

    if bytes_value < 1024.0f64.powi(2) {
        format!("{} KB", (bytes_value / 1024.0) as i64)
    } else if bytes_value < 1024.0f64.powi(3) {
        format!("{} MB", (bytes_value / 1024.0f64.powi(2)) as i64)
    } else if bytes_value < 1024.0f64.powi(4) {
        format!("{:.2} GB", bytes_value / 1024.0f64.powi(3))
    } else if bytes_value < 1024.0f64.powi(5) {
        format!("{:.2} TB", bytes_value / 1024.0f64.powi(4))
    } else {
        format!("{:.2} PB", bytes_value / 1024.0f64.powi(5))
    }
}

/// Parses a CPU quantity (e.g. `"250m"`, `"500000000n"`, `"1"`) into a
/// human string such as `"0.25 cores"`. Quantities with no recognized
/// suffix are returned unchanged (whole-core counts).
pub fn parse_cpu(resource_str: &str) -> String {
    let (suffix, divisor) = if resource_str.ends_with('n') {
        ("n", 1e9)
    } else if resource_str.ends_with('u') {
        ("u", 1e6)
    } else if resource_str.ends_with('m') {
        ("m", 1e3)
    } else {
        return resource_str.to_owned();
    };
    let raw = &resource_str[..resource_str.len() - suffix.len()];
    let value: f64 = match raw.parse() {
        Ok(v) => v,
        Err(_) => return resource_str.to_owned(),
    };
    let cores = value / divisor;
    format!("{} cores", trim_trailing_zeroes(cores))
}

fn trim_trailing_zeroes(value: f64) -> String {
    let s = format!("{:.3}", value);
    let s = s.trim_end_matches('0');
    let s = s.trim_end_matches('.');
    if s.is_empty() {
        "0".to_owned()
    } else {
        s.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_units() {
        assert_eq!(parse_memory("1048576"), "1 MB");
        assert_eq!(parse_memory("512Ki"), "512 KB");
        assert_eq!(parse_memory("2Gi"), "2.00 GB");
    }

    #[test]
    fn cpu_nanocores() {
        assert_eq!(parse_cpu("250000000n"), "0.25 cores");
        assert_eq!(parse_cpu("500000u"), "0.5 cores");
    }

    #[test]
    fn cpu_millicores() {
        assert_eq!(parse_cpu("250m"), "0.25 cores");
        assert_eq!(parse_cpu("1000m"), "1 cores");
    }

    #[test]
    fn cpu_without_suffix_passes_through() {
        assert_eq!(parse_cpu("2"), "2");
    }
}
