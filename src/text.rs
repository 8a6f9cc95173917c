//! Text helpers: trimming, header prefix matching, base64, percent-encoding, HTML escaping and
//! date formatting.

use std::time::SystemTime;

use chrono::{DateTime, Local, Utc};

/// Trim spaces, tabs and line endings from both ends.
pub fn trim(s: &str) -> &str {
    s.trim_matches(|c| matches!(c, ' ' | '\t' | '\r' | '\n'))
}

/// If `line` starts with `prefix` (ASCII case-insensitive), return the rest of the line.
pub fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}

/// Split a comma separated list, trimming each item and dropping empty ones.
pub fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

const BASE64_TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Decode base64, stopping at the first padding or invalid character.
pub fn base64_decode(encoded: &str) -> Vec<u8> {
    let mut decoded = Vec::with_capacity(encoded.len() * 3 / 4);
    let mut quad: u32 = 0;
    let mut count = 0;
    for c in encoded.bytes() {
        let value = match BASE64_TABLE.iter().position(|&b| b == c) {
            Some(value) => value as u32,
            None => break,
        };
        quad = (quad << 6) | value;
        count += 1;
        if count == 4 {
            decoded.extend_from_slice(&[(quad >> 16) as u8, (quad >> 8) as u8, quad as u8]);
            quad = 0;
            count = 0;
        }
    }
    // leftover sextets carry one or two more bytes
    match count {
        2 => decoded.push((quad >> 4) as u8),
        3 => decoded.extend_from_slice(&[(quad >> 10) as u8, (quad >> 2) as u8]),
        _ => {}
    }
    decoded
}

/// Encode string to be an RFC3986-compliant URL part.
pub struct UrlEncoded<'a>(pub &'a str);

impl<'a> std::fmt::Display for UrlEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~') {
                write!(f, "{}", c)?;
            } else {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for b in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", b)?;
                }
            }
        }
        Ok(())
    }
}

/// Decode URL by converting %XX (where XX are hexadecimal digits) to the byte it represents.
pub fn url_decode(url: &str) -> Vec<u8> {
    let url = url.as_bytes();
    let mut decoded = Vec::with_capacity(url.len());
    let mut i = 0;
    while i < url.len() {
        let c = url[i];
        if c == b'%'
            && i + 2 < url.len()
            && url[i + 1].is_ascii_hexdigit()
            && url[i + 2].is_ascii_hexdigit()
        {
            decoded.push(hex_to_digit(url[i + 1]) * 16 + hex_to_digit(url[i + 2]));
            i += 3;
        } else {
            decoded.push(c);
            i += 1;
        }
    }
    decoded
}

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> u8 {
    if (b'A'..=b'F').contains(&hex) {
        hex - b'A' + 10
    } else if (b'a'..=b'f').contains(&hex) {
        hex - b'a' + 10
    } else {
        hex - b'0'
    }
}

/// Escape < > & ' " into HTML entities.
pub struct HtmlEscaped<'a>(pub &'a str);

impl<'a> std::fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => write!(f, "&lt;")?,
                '>' => write!(f, "&gt;")?,
                '&' => write!(f, "&amp;")?,
                '\'' => write!(f, "&apos;")?,
                '"' => write!(f, "&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}

/// Encode string for logging. Logs should not contain control characters or double quotes.
pub struct LogEncoded<'a>(pub &'a str);

impl<'a> std::fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            if !c.is_ascii() || c.is_ascii_control() || c == '"' {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for b in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", b)?;
                }
            } else {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

/// RFC1123 formatted date.
pub struct HttpDate(pub SystemTime);

impl std::fmt::Display for HttpDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Utc>::from(self.0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

/// Common Log Format (CLF) formatted date in local timezone.
pub struct ClfDate(pub SystemTime);

impl std::fmt::Display for ClfDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Local>::from(self.0);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

/// Date column of a directory listing, in GMT.
pub struct ListingDate(pub SystemTime);

impl std::fmt::Display for ListingDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Utc>::from(self.0);
        write!(f, "{}", datetime.format("%d-%b-%Y %H:%M"))
    }
}

/// Size column of a directory listing.
pub struct ListingSize(pub u64);

impl std::fmt::Display for ListingSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let size = self.0;
        if size < 1000 {
            write!(f, "{}", size)
        } else if size < 1_000_000 {
            write!(f, "{}K", size / 1000)
        } else {
            write!(f, "{:.1}M", size as f64 / 1_000_000.0)
        }
    }
}
