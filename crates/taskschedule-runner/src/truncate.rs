//! Output capping for execution history.
//!
//! Scripts can print without bound, and every byte ends up in the
//! `executions` table. Captured streams are cut in the middle so the first
//! lines (what the script started doing) and the last lines (the final
//! result or traceback) both survive.

/// Cap `output` at `max_chars` characters, omitting the middle.
///
/// The result for an oversized input is:
///
/// ```text
/// <first max_chars/2 chars>
///
/// ... [OUTPUT TRUNCATED: N chars omitted] ...
///
/// <last max_chars/2 chars>
/// ```
///
/// Cuts happen on character boundaries, never inside a multi-byte sequence.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    // Byte length bounds char count from above.
    if output.len() <= max_chars {
        return output.to_owned();
    }

    let total = output.chars().count();
    if total <= max_chars {
        return output.to_owned();
    }

    let half = max_chars / 2;
    let head_end = byte_offset(output, half);
    let tail_start = byte_offset(output, total - half);
    let omitted = total - 2 * half;

    format!(
        "{}\n\n... [OUTPUT TRUNCATED: {omitted} chars omitted] ...\n\n{}",
        &output[..head_end],
        &output[tail_start..]
    )
}

/// Byte offset of the `n`-th character (or the string length past the end).
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_returned_as_is() {
        assert_eq!(truncate_output("hello world", 100), "hello world");
        assert_eq!(truncate_output("", 100), "");
    }

    #[test]
    fn exact_boundary_not_truncated() {
        let s = "x".repeat(500);
        let result = truncate_output(&s, 500);
        assert_eq!(result, s);
    }

    #[test]
    fn keeps_head_and_tail() {
        let input = format!("{}{}{}", "A".repeat(100), "B".repeat(300), "C".repeat(100));
        let result = truncate_output(&input, 200);

        assert!(result.starts_with(&"A".repeat(100)));
        assert!(result.ends_with(&"C".repeat(100)));
        assert!(!result.contains('B'));
        assert!(result.contains("300 chars omitted"));
    }

    #[test]
    fn odd_limit_counts_omitted_chars_exactly() {
        let s = "z".repeat(200);
        let result = truncate_output(&s, 101);
        // 50 head + 50 tail kept
        assert!(result.contains("100 chars omitted"));
    }

    #[test]
    fn multibyte_chars_are_not_split() {
        // 3 bytes each: byte length is over the limit, char count is not
        let fits = "€".repeat(100);
        assert_eq!(truncate_output(&fits, 150), fits);

        let big = "€".repeat(1_000);
        let result = truncate_output(&big, 100);
        assert!(result.contains("900 chars omitted"));
        assert!(result.starts_with('€'));
        assert!(result.ends_with('€'));
    }
}
