//! Text canonicalisation for locale- and whitespace-insensitive comparison.
//!
//! Subjects and sender names arrive from many mail clients, often with
//! Vietnamese diacritics, stray zero-width characters or non-breaking
//! spaces. Every comparison in the matcher goes through [`normalize`].

use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Zero-width and format characters dropped before comparison.
const ZERO_WIDTH: [char; 4] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}'];

/// Canonicalise a free-text field.
///
/// Canonical decomposition, strip zero-width characters and combining marks,
/// turn non-breaking spaces into spaces, collapse whitespace runs, trim, and
/// uppercase. Idempotent: `normalize(&normalize(s)) == normalize(s)`.
pub fn normalize(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }

    let stripped: String = s
        .nfd()
        .filter(|c| !ZERO_WIDTH.contains(c) && !is_combining_mark(*c))
        .map(|c| if c == '\u{00A0}' { ' ' } else { c })
        .collect();

    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    // Uppercasing can reintroduce decomposable characters (e.g. 'ǰ' -> "J̌"),
    // so marks are stripped once more to keep the function idempotent.
    collapsed
        .to_uppercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_vietnamese_diacritics() {
        assert_eq!(normalize("Hoàn tiền"), normalize("HOAN TIEN"));
        assert_eq!(normalize("THÔNG BÁO HOÀN TIỀN"), "THONG BAO HOAN TIEN");
    }

    #[test]
    fn keeps_letters_without_decomposition() {
        // 'đ' has no canonical decomposition; it is only uppercased.
        assert_eq!(normalize("đơn hàng"), "ĐON HANG");
    }

    #[test]
    fn drops_zero_width_characters() {
        assert_eq!(normalize("VIET\u{200B}COM\u{200D}BANK\u{FEFF}"), "VIETCOMBANK");
    }

    #[test]
    fn non_breaking_space_becomes_space() {
        assert_eq!(normalize("Cashback\u{00A0}Visa"), "CASHBACK VISA");
    }

    #[test]
    fn collapses_and_trims_whitespace() {
        assert_eq!(normalize("  Monthly \t\n statement   "), "MONTHLY STATEMENT");
    }

    #[test]
    fn empty_input() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize(" \u{200B} "), "");
    }

    #[test]
    fn idempotent_over_mixed_inputs() {
        let samples = [
            "Hoàn tiền",
            "  Sao kê\u{00A0}thẻ  tín dụng ",
            "ǰ café ß",
            "Straße Ångström",
            "\u{FEFF}Ưu đãi tháng 12",
            "already NORMAL",
        ];
        for s in samples {
            let once = normalize(s);
            assert_eq!(normalize(&once), once, "not idempotent for {s:?}");
        }
    }
}
