use std::sync::LazyLock;

use archiver_logging::archiver_warn;
use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8};
use regex::bytes::Regex;

/// How far into the document a `<meta charset>` declaration is looked for.
const META_PRESCAN_BYTES: usize = 1024;

/// Matches both `<meta charset=..>` and the `http-equiv` form, whose
/// `content` attribute carries `charset=..`.
static META_CHARSET: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?i-u)<meta\b[^>]*?charset\s*=\s*["']?\s*([a-z0-9_:.\-]+)"#).ok()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedHtml {
    pub html: String,
    pub encoding_label: String,
    /// Malformed sequences were replaced with U+FFFD.
    pub had_errors: bool,
}

/// Decode raw bytes into UTF-8 using: BOM -> Content-Type charset ->
/// `<meta charset>` prescan -> chardetng fallback.
///
/// Decoding never fails; malformed input is replaced and flagged so the page is
/// still archived.
pub fn decode_html(bytes: &[u8], content_type: Option<&str>) -> DecodedHtml {
    // 1) BOM aware decode using encoding_rs helper
    if let Some((encoding, _)) = Encoding::for_bom(bytes) {
        return decode_with(bytes, encoding);
    }

    // 2) Content-Type header charset
    if let Some(label) = content_type.and_then(extract_charset) {
        if let Some(enc) = Encoding::for_label(label.as_bytes()) {
            return decode_with(bytes, enc);
        }
    }

    // 3) <meta charset> near the top of the document
    if let Some(enc) = meta_charset(bytes) {
        return decode_with(bytes, enc);
    }

    // 4) chardetng statistical detection
    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    let enc = detector.guess(None, true);
    decode_with(bytes, enc)
}

fn extract_charset(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("charset")
                .then(|| value.trim_matches([' ', '"', '\''].as_ref()).to_string())
        })
        .find(|value| !value.is_empty())
}

fn meta_charset(bytes: &[u8]) -> Option<&'static Encoding> {
    let head = &bytes[..bytes.len().min(META_PRESCAN_BYTES)];
    let captures = META_CHARSET.as_ref()?.captures(head)?;
    let enc = Encoding::for_label(captures.get(1)?.as_bytes())?;
    // A byte-oriented declaration cannot truthfully claim UTF-16.
    if enc == UTF_16LE || enc == UTF_16BE {
        Some(UTF_8)
    } else {
        Some(enc)
    }
}

fn decode_with(bytes: &[u8], enc: &'static Encoding) -> DecodedHtml {
    let (text, used, had_errors) = enc.decode(bytes);
    if had_errors {
        archiver_warn!("Replaced malformed {} sequences while decoding", used.name());
    }
    DecodedHtml {
        html: text.into_owned(),
        encoding_label: used.name().to_string(),
        had_errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charset_parameter_is_case_insensitive_and_unquoted() {
        assert_eq!(
            extract_charset("text/html; Charset=\"ISO-8859-1\""),
            Some("ISO-8859-1".to_string())
        );
        assert_eq!(extract_charset("text/html"), None);
        assert_eq!(extract_charset("text/html; charset="), None);
    }

    #[test]
    fn meta_charset_is_honoured_without_header() {
        let page = b"<html><head><meta charset=\"windows-1252\"></head><body>caf\xe9</body></html>";
        let decoded = decode_html(page, Some("text/html"));
        assert_eq!(decoded.encoding_label, "windows-1252");
        assert!(decoded.html.contains("caf\u{e9}"));
    }

    #[test]
    fn http_equiv_meta_is_honoured() {
        let page = b"<meta http-equiv=\"Content-Type\" content=\"text/html; charset=ISO-8859-1\"><p>\xe9t\xe9</p>";
        let decoded = decode_html(page, None);
        assert_eq!(decoded.encoding_label, "windows-1252");
        assert!(decoded.html.contains("\u{e9}t\u{e9}"));
    }

    #[test]
    fn header_charset_beats_meta() {
        let page = "<meta charset=\"windows-1252\"><p>caf\u{e9}</p>".as_bytes();
        let decoded = decode_html(page, Some("text/html; charset=utf-8"));
        assert_eq!(decoded.encoding_label, "UTF-8");
        assert!(!decoded.had_errors);
    }

    #[test]
    fn meta_claiming_utf16_means_utf8() {
        let page = "<meta charset=\"utf-16\"><p>caf\u{e9}</p>".as_bytes();
        assert_eq!(decode_html(page, None).encoding_label, "UTF-8");
    }

    #[test]
    fn meta_charset_pattern_compiles() {
        assert!(META_CHARSET.is_some());
    }

    #[test]
    fn invalid_utf8_is_replaced_not_rejected() {
        let decoded = decode_html(b"ok \xff\xfe!", Some("text/html; charset=utf-8"));
        assert!(decoded.had_errors);
        assert!(decoded.html.starts_with("ok "));
        assert!(decoded.html.contains('\u{FFFD}'));
    }
}
