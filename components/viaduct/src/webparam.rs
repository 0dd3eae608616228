/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! `application/x-www-form-urlencoded` encoding for the token endpoint's form bodies.
//!
//! This is RFC 3986 percent-encoding of reserved characters, plus the `+`-for-space convention
//! that `url::form_urlencoded` also implements — but the agent spec calls this out by name
//! ("WebParam encoding") as an exact wire contract, so it gets its own small, obviously-correct
//! implementation rather than relying on `url`'s crate-internal choices matching it.

/// Percent-encode a single value for use in a form body: alphanumerics and `-_.~` pass through
/// unescaped, space becomes `+`, everything else is percent-encoded.
fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Inverse of [`encode_component`].
fn decode_component(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(decoded) => {
                        out.push(decoded);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Encode `fields` as a form body: `k1=v1&k2=v2`, each key and value WebParam-encoded.
pub fn encode_form(fields: &[(&str, &str)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Parse a form body produced by [`encode_form`] (or any WebParam-encoded body) back into pairs,
/// preserving order.
pub fn decode_form(body: &str) -> Vec<(String, String)> {
    if body.is_empty() {
        return Vec::new();
    }
    body.split('&')
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode_component(k), decode_component(v)),
            None => (decode_component(pair), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_reserved_chars() {
        assert_eq!(encode_component("a b+c/d"), "a+b%2Bc%2Fd");
        assert_eq!(encode_component("grant_type"), "grant_type");
    }

    #[test]
    fn test_round_trip_identity() {
        let cases = [
            "hello world",
            "grant_type=refresh_token",
            "unicode: héllo wörld 🎉",
            "",
            "a=b&c=d",
            "%%%percent%%%",
            "newline\nand\ttab",
        ];
        for case in cases {
            let encoded = encode_component(case);
            assert_eq!(decode_component(&encoded), case, "roundtrip failed for {case:?}");
        }
    }

    #[test]
    fn test_encode_form_and_decode_form() {
        let fields = [
            ("grant_type", "refresh_token"),
            ("refresh_token", "RT"),
            ("client_id", "CID"),
            ("client_secret", "CS"),
        ];
        let body = encode_form(&fields);
        assert_eq!(
            body,
            "grant_type=refresh_token&refresh_token=RT&client_id=CID&client_secret=CS"
        );
        let decoded = decode_form(&body);
        let expected: Vec<(String, String)> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_decode_then_encode_identity() {
        let body = "a=1&b=hello+world&c=x%2By";
        let decoded = decode_form(body);
        let pairs: Vec<(&str, &str)> = decoded.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        assert_eq!(encode_form(&pairs), body);
    }
}
