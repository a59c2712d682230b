//! Charset detection for response bodies and query encoding.
//!
//! Many of the sites this crate targets still serve GBK without declaring it
//! in the `Content-Type` header, so bodies are decoded from raw bytes:
//! header charset first, then BOM, then a `<meta>` sniff of the first few
//! kilobytes, then UTF-8.

use std::sync::LazyLock;

use encoding_rs::{Encoding, UTF_8};
use regex::bytes::Regex;

/// How many leading bytes are searched for a `<meta>` charset.
const SNIFF_WINDOW: usize = 4096;

static META_CHARSET: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?i)<meta[^>]+charset\s*=\s*["']?\s*([a-z0-9_\-:]+)"#).ok()
});

/// Decodes a body, returning the text and the encoding used.
#[must_use]
pub fn decode_body(bytes: &[u8], content_type: Option<&str>) -> (String, &'static Encoding) {
    let encoding = content_type
        .and_then(charset_from_content_type)
        .or_else(|| Encoding::for_bom(bytes).map(|(encoding, _)| encoding))
        .or_else(|| sniff_meta_charset(bytes))
        .unwrap_or(UTF_8);
    let (text, used, _had_errors) = encoding.decode(bytes);
    (text.into_owned(), used)
}

/// Reads the `charset=` parameter of a Content-Type value.
#[must_use]
pub fn charset_from_content_type(content_type: &str) -> Option<&'static Encoding> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        Encoding::for_label(value.trim().trim_matches(['"', '\'']).as_bytes())
    })
}

fn sniff_meta_charset(bytes: &[u8]) -> Option<&'static Encoding> {
    let window = &bytes[..bytes.len().min(SNIFF_WINDOW)];
    let regex = META_CHARSET.as_ref()?;
    let captures = regex.captures(window)?;
    Encoding::for_label(captures.get(1)?.as_bytes())
}

/// Percent-encodes a search keyword in the given charset.
#[must_use]
pub fn encode_query(keyword: &str, charset: Option<&'static Encoding>) -> String {
    match charset {
        Some(encoding) if encoding != UTF_8 => {
            let (bytes, _, _) = encoding.encode(keyword);
            urlencoding::encode_binary(&bytes).into_owned()
        }
        _ => urlencoding::encode(keyword).into_owned(),
    }
}
