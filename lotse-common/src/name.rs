use sha2::{Digest, Sha256};

/// Generates a Kubernetes-safe resource name: `{prefix}-{7 hex chars}`,
/// lowercased, with anything outside `[a-z0-9.-]` collapsed to `-`, and
/// leading/trailing non-alphanumerics stripped. Falls back to `"resource"`
/// if sanitization empties the string, and truncates to the 253-character
/// DNS subdomain limit.
pub fn generate_name(prefix: &str) -> String {
    let random_guid = uuid::Uuid::new_v4().to_string();
    let digest = Sha256::digest(random_guid.as_bytes());
    let short_sha = hex_prefix(&digest, 7);
    let name = format!("{}-{}", prefix, short_sha).to_lowercase();

    let sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-' { c } else { '-' })
        .collect();

    let trimmed = sanitized
        .trim_start_matches(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit()))
        .trim_end_matches(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit()));

    let result = if trimmed.is_empty() { "resource" } else { trimmed };
    result.chars().take(253).collect()
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<String>().chars().take(n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_name_is_dns_safe() {
        let name = generate_name("my-package");
        assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-'));
        assert!(!name.starts_with('-'));
        assert!(!name.ends_with('-'));
        assert!(name.starts_with("my-package-"));
        assert_eq!(name.len(), "my-package-".len() + 7);
    }

    #[test]
    fn weird_prefix_still_sanitizes() {
        let name = generate_name("___");
        assert!(!name.is_empty());
        assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-'));
    }
}
