use std::fs;
use std::path::Path;

/// Parse `KEY=value` lines. Blank lines, comments, and malformed lines are skipped; values
/// may be single- or double-quoted and may carry a trailing `# comment`.
pub fn parse_env_lines(content: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }

        let value = value.trim();
        let parsed = if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            &value[1..value.len() - 1]
        } else {
            value.split('#').next().unwrap_or("").trim()
        };
        out.push((key.to_string(), parsed.to_string()));
    }
    out
}

/// Load `.env` from `path` into the process environment without overriding variables that
/// are already set.
pub fn load_dot_env(path: &Path) -> usize {
    if !path.exists() {
        return 0;
    }
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("[ENV] Failed to read {}: {}", path.display(), e);
            return 0;
        }
    };

    let mut applied = 0usize;
    for (key, value) in parse_env_lines(&content) {
        if std::env::var_os(&key).is_some() {
            continue;
        }
        std::env::set_var(&key, value);
        applied += 1;
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::parse_env_lines;

    #[test]
    fn test_parse_env_lines_handles_quotes_and_comments() {
        let parsed = parse_env_lines(
            "# comment\nETH_RPC_URL=\"https://rpc.example/#frag\"\nexport SPIDER_MAX_IN_FLIGHT=4 # cap\nbroken\n",
        );
        assert_eq!(
            parsed,
            vec![
                (
                    "ETH_RPC_URL".to_string(),
                    "https://rpc.example/#frag".to_string()
                ),
                ("SPIDER_MAX_IN_FLIGHT".to_string(), "4".to_string()),
            ]
        );
    }
}
