use rand::Rng;

/// instance_id は環境変数からインスタンス ID を解決する。
/// 未設定または空の場合は `<prefix>-<0..1000 の乱数>` を返す。
pub fn instance_id(env_var: &str, prefix: &str) -> String {
    resolve_instance_id(std::env::var(env_var).ok(), prefix)
}

fn resolve_instance_id(value: Option<String>, prefix: &str) -> String {
    match value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(id) => id,
        None => format!("{prefix}-{}", rand::thread_rng().gen_range(0..1000)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_value_wins() {
        assert_eq!(
            resolve_instance_id(Some("consumer-a".to_string()), "consumer"),
            "consumer-a"
        );
    }

    #[test]
    fn test_fallback_is_prefixed_random() {
        for value in [None, Some("  ".to_string())] {
            let id = resolve_instance_id(value, "producer");
            let suffix = id.strip_prefix("producer-").unwrap();
            let n: u32 = suffix.parse().unwrap();
            assert!(n < 1000);
        }
    }
}
