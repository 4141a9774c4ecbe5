use std::str::FromStr;

/// 读取布尔环境变量：存在且不为 "0" / "false" / "off" / "no" 则为 true（大小写不敏感）
pub fn env_bool(key: &str) -> bool {
    env_string(key).is_some_and(|v| {
        let v = v.to_ascii_lowercase();
        !matches!(v.as_str(), "0" | "false" | "off" | "no")
    })
}

/// Parsed variable; unset or unparsable falls back to `default`.
pub fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_string(key)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// 秒数，至少 1
pub fn env_secs_min1(key: &str, default_secs: u64) -> u64 {
    env_parse(key, default_secs).max(1)
}

/// Non-empty string variable, trimmed.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn flags() {
        std::env::set_var("SB_SUBS_T1", "1");
        assert!(env_bool("SB_SUBS_T1"));
        std::env::set_var("SB_SUBS_T1", " TRUE ");
        assert!(env_bool("SB_SUBS_T1"));
        std::env::set_var("SB_SUBS_T1", "Off");
        assert!(!env_bool("SB_SUBS_T1"));
        std::env::remove_var("SB_SUBS_T1");
        assert!(!env_bool("SB_SUBS_T1"));
    }

    #[test]
    #[serial]
    fn numbers_fall_back_on_garbage() {
        std::env::set_var("SB_SUBS_N1", "1500");
        assert_eq!(env_parse("SB_SUBS_N1", 7u64), 1500);
        assert_eq!(env_parse("SB_SUBS_N1", 7usize), 1500);
        std::env::set_var("SB_SUBS_N1", "abc");
        assert_eq!(env_parse("SB_SUBS_N1", 7u64), 7);
        std::env::set_var("SB_SUBS_N2", "0"); // min1 生效
        assert_eq!(env_secs_min1("SB_SUBS_N2", 9), 1);
        std::env::remove_var("SB_SUBS_N1");
        std::env::remove_var("SB_SUBS_N2");
    }

    #[test]
    #[serial]
    fn blank_string_is_none() {
        std::env::set_var("SB_SUBS_S1", "   ");
        assert_eq!(env_string("SB_SUBS_S1"), None);
        std::env::set_var("SB_SUBS_S1", " x ");
        assert_eq!(env_string("SB_SUBS_S1").as_deref(), Some("x"));
        std::env::remove_var("SB_SUBS_S1");
    }
}
