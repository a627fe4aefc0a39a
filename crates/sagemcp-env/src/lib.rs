/// Parse a boolean-like env var.
///
/// Truthy values (case-insensitive): `1`, `true`, `yes`, `y`, `on`.
#[must_use]
pub fn flag(name: &str) -> bool {
    matches!(
        std::env::var(name)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

/// Parse a positive (`> 0`) u64 env var.
#[must_use]
pub fn positive_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}

/// Parse a positive (`> 0`) usize env var.
#[must_use]
pub fn positive_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
}

/// Expand `${VAR}` occurrences in a string using environment variables.
///
/// # Errors
///
/// Returns `Err(...)` when a referenced environment variable is not set.
pub fn expand_env_string(s: &str) -> Result<String, String> {
    let mut result = s.to_string();
    let mut start = 0usize;

    while let Some(dollar_pos) = result[start..].find("${") {
        let abs_pos = start + dollar_pos;
        if let Some(end_pos) = result[abs_pos..].find('}') {
            let var_name = &result[abs_pos + 2..abs_pos + end_pos];
            let var_value = std::env::var(var_name).map_err(|_| {
                format!("Environment variable '{var_name}' not found (referenced in config)")
            })?;
            result = format!(
                "{}{}{}",
                &result[..abs_pos],
                var_value,
                &result[abs_pos + end_pos + 1..]
            );
            start = abs_pos + var_value.len();
        } else {
            start = abs_pos + 2;
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_accepts_truthy_forms() {
        std::env::set_var("SAGEMCP_ENV_TEST_FLAG", "Yes");
        assert!(flag("SAGEMCP_ENV_TEST_FLAG"));
        std::env::set_var("SAGEMCP_ENV_TEST_FLAG", "0");
        assert!(!flag("SAGEMCP_ENV_TEST_FLAG"));
        assert!(!flag("SAGEMCP_ENV_TEST_FLAG_UNSET"));
    }

    #[test]
    fn positive_u64_rejects_zero_and_garbage() {
        std::env::set_var("SAGEMCP_ENV_TEST_U64", "0");
        assert_eq!(positive_u64("SAGEMCP_ENV_TEST_U64"), None);
        std::env::set_var("SAGEMCP_ENV_TEST_U64", "12");
        assert_eq!(positive_u64("SAGEMCP_ENV_TEST_U64"), Some(12));
        std::env::set_var("SAGEMCP_ENV_TEST_U64", "nope");
        assert_eq!(positive_u64("SAGEMCP_ENV_TEST_U64"), None);
    }

    #[test]
    fn expand_env_string_missing_var_errors() {
        assert!(expand_env_string("${SAGEMCP_ENV_TEST_DEFINITELY_MISSING}").is_err());
        std::env::set_var("SAGEMCP_ENV_TEST_PRESENT", "x");
        assert_eq!(
            expand_env_string("a-${SAGEMCP_ENV_TEST_PRESENT}-b").as_deref(),
            Ok("a-x-b")
        );
    }
}
