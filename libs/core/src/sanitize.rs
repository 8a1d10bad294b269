//! Masking helpers applied before any error or number reaches logs, the API,
//! or the database. Digit runs of six or more are treated as phone numbers or
//! provider ids and must never leak.

const MAX_ERROR_LEN: usize = 80;

/// Masks digit runs of 6+ characters (with an optional leading `+`) and caps
/// the result at 80 characters.
pub fn sanitize_error(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let run_start = i;
        let mut j = i;
        let has_plus = bytes[j] == b'+';
        if has_plus {
            j += 1;
        }
        let digits_start = j;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if j - digits_start >= 6 {
            out.push_str("***");
            i = j;
        } else {
            // Not a maskable run; copy the char at run_start and continue.
            let ch_len = text[run_start..].chars().next().map_or(1, char::len_utf8);
            out.push_str(&text[run_start..run_start + ch_len]);
            i = run_start + ch_len;
        }
    }
    if out.len() > MAX_ERROR_LEN {
        let mut cut = MAX_ERROR_LEN;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    }
    out
}

/// Masks all but the last four characters of a phone number.
pub fn mask_phone(phone: &str) -> String {
    if phone.len() < 4 {
        return "****".to_string();
    }
    let tail: String = phone.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    let masked_len = phone.chars().count().saturating_sub(4);
    format!("{}{}", "*".repeat(masked_len), tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_digit_runs_are_masked() {
        let out = sanitize_error("dial failed for +15551234567 (code 42)");
        assert_eq!(out, "dial failed for *** (code 42)");
    }

    #[test]
    fn short_digit_runs_survive() {
        assert_eq!(sanitize_error("HTTP 502 from vendor"), "HTTP 502 from vendor");
    }

    #[test]
    fn output_is_length_capped() {
        let long = "x".repeat(200);
        assert_eq!(sanitize_error(&long).len(), 80);
    }

    #[test]
    fn sanitized_output_has_no_long_digit_run() {
        let out = sanitize_error("ids 123456789 and 987654 and 12345");
        assert!(!out.contains("123456789"));
        assert!(!out.contains("987654"));
        assert!(out.contains("12345"));
    }

    #[test]
    fn phone_masking_keeps_last_four() {
        assert_eq!(mask_phone("+15551234567"), "********4567");
        assert_eq!(mask_phone("123"), "****");
    }
}
