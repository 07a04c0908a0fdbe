/// Collapse a provider error into one bounded line: drop echoed request payloads and
/// backtraces, squeeze whitespace, and truncate.
pub fn compact_error_message(message: &str, max_len: usize) -> String {
    let mut raw = message;
    if let Some((prefix, _)) = raw.split_once(" text: ") {
        raw = prefix;
    }
    if let Some((prefix, _)) = raw.split_once("Stack backtrace:") {
        raw = prefix;
    }

    let mut compact = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.len() > max_len {
        let mut cut = max_len;
        while !compact.is_char_boundary(cut) {
            cut -= 1;
        }
        compact.truncate(cut);
        compact.push_str("...(truncated)");
    }
    compact
}

#[cfg(test)]
mod tests {
    use super::compact_error_message;

    #[test]
    fn test_compact_error_message_elides_payload_and_backtrace() {
        let raw = "error sending request text: \"{...huge...}\"\nStack backtrace:\n 0: frame";
        let compact = compact_error_message(raw, 260);
        assert_eq!(compact, "error sending request");
    }

    #[test]
    fn test_compact_error_message_truncates_on_char_boundary() {
        let compact = compact_error_message("ééééé", 3);
        assert_eq!(compact, "é...(truncated)");
    }
}
