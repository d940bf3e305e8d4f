use std::sync::OnceLock;

use regex::Regex;

const MAX_LOG_CHARS: usize = 4096;

// CSI, OSC (BEL- or ST-terminated) and other ST-terminated escape sequences.
fn escape_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\x1b(?:\[[0-?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)?|[PX^_][^\x1b]*(?:\x1b\\)?|.)",
        )
        .expect("escape pattern")
    })
}

/// Strip terminal escape sequences and control characters from one line of
/// subprocess output before it reaches the sink.
pub fn sanitize_log_line(input: &str) -> String {
    let stripped = escape_re().replace_all(input, "");
    let mut out = String::with_capacity(stripped.len().min(MAX_LOG_CHARS));
    let mut count = 0usize;
    let mut truncated = false;

    for c in stripped.chars() {
        let keep = match c {
            '\r' | '\n' => continue,
            '\t' => ' ',
            c if c.is_control() || is_format_control(c) => continue,
            c => c,
        };
        out.push(keep);
        count += 1;
        if count >= MAX_LOG_CHARS {
            truncated = true;
            break;
        }
    }

    if truncated {
        out.push_str(" ...[truncated]");
    }
    out
}

fn is_format_control(c: char) -> bool {
    c == '\u{061C}'
        || c == '\u{200E}'
        || c == '\u{200F}'
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

#[cfg(test)]
mod tests {
    use super::sanitize_log_line;

    #[test]
    fn strips_color_and_title_sequences() {
        let input = "ok \u{1b}[31mred\u{1b}[0m \u{1b}]0;title\u{7} done";
        assert_eq!(sanitize_log_line(input), "ok red  done");
    }

    #[test]
    fn strips_st_terminated_sequences() {
        let input = "a\u{1b}Ppayload\u{1b}\\b";
        assert_eq!(sanitize_log_line(input), "ab");
    }

    #[test]
    fn strips_newlines_tabs_and_bidi_controls() {
        let input = "a\tb\nc\r\u{202e}x";
        assert_eq!(sanitize_log_line(input), "a bcx");
    }

    #[test]
    fn truncates_very_long_lines() {
        let input = "y".repeat(5000);
        let got = sanitize_log_line(&input);
        assert!(got.ends_with("...[truncated]"));
        assert!(got.len() < input.len());
    }
}
