//! URL query string and `application/x-www-form-urlencoded` decoding.

use std::borrow::Cow;
use std::collections::HashMap;

/// Parses `key=value&key2=value2` into a map, percent-decoding both sides.
///
/// `+` decodes to a space. Pairs without `=` map to an empty value and empty
/// segments (`a=1&&b=2`) are skipped. A repeated key keeps its last value.
///
/// # Examples
///
/// ```
/// use portico::http::query::parse_url_encoded;
///
/// let args = parse_url_encoded("name=J%C3%BCrgen+M&debug&x=1&x=2");
/// assert_eq!(args["name"], "Jürgen M");
/// assert_eq!(args["debug"], "");
/// assert_eq!(args["x"], "2");
/// ```
pub fn parse_url_encoded(input: &str) -> HashMap<String, String> {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_form_component(key), decode_form_component(value))
        })
        .collect()
}

/// Decodes one form component: `+` becomes a space, then `%XX` escapes are
/// resolved. Invalid UTF-8 after decoding is replaced rather than rejected.
pub fn decode_form_component(component: &str) -> String {
    let spaced: Cow<'_, str> = if component.contains('+') {
        Cow::Owned(component.replace('+', " "))
    } else {
        Cow::Borrowed(component)
    };
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(spaced.as_bytes())).into_owned(),
    }
}

/// Percent-decodes a URL path. `+` is left untouched.
///
/// Returns `None` when the decoded bytes are not valid UTF-8.
pub fn decode_path(path: &str) -> Option<String> {
    urlencoding::decode(path).ok().map(Cow::into_owned)
}
