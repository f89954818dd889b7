//! Transport level addressing: anonymous URI prefixes and the action carried outside the message.

use http::HeaderMap;
use micro_soap::message::EnvelopeVersion;
use tracing::trace;

pub const SOAP_ACTION: &str = "soapaction";

/// Recognizes destinations registered as anonymous, i.e. meaning "reply on this connection".
#[derive(Debug, Clone, Default)]
pub struct AnonymousUriPrefixMatcher {
    prefixes: Vec<String>,
}

impl AnonymousUriPrefixMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_prefix<S: Into<String>>(&mut self, prefix: S) {
        let prefix = prefix.into();
        if !self.prefixes.iter().any(|existing| existing.eq_ignore_ascii_case(&prefix)) {
            self.prefixes.push(prefix);
        }
    }

    pub fn with_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.add_prefix(prefix);
        self
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    /// Returns true if `uri` starts with one of the registered prefixes, ignoring ASCII case.
    pub fn is_anonymous_uri(&self, uri: &str) -> bool {
        self.prefixes.iter().any(|prefix| {
            uri.len() >= prefix.len()
                && uri.is_char_boundary(prefix.len())
                && uri[..prefix.len()].eq_ignore_ascii_case(prefix)
        })
    }
}

/// Extracts the action a request announces outside of the message itself.
///
/// SOAP 1.1 carries it in the `SOAPAction` header. SOAP 1.2 puts it in the `action` parameter of
/// the content type, or of the `start-info` parameter for `multipart/related` payloads.
pub fn transport_action(headers: &HeaderMap, envelope: EnvelopeVersion, content_type: Option<&str>) -> Option<String> {
    let raw = match envelope {
        EnvelopeVersion::None => return None,
        EnvelopeVersion::Soap11 => headers.get(SOAP_ACTION).and_then(|value| value.to_str().ok()).map(str::to_string),
        EnvelopeVersion::Soap12 => content_type.and_then(action_parameter),
    }?;

    let action = percent_decode(unquote(raw.trim()));
    trace!(action, "extracted transport action");
    (!action.is_empty()).then_some(action)
}

fn action_parameter(content_type: &str) -> Option<String> {
    let media_type = content_type.split(';').next().unwrap_or_default().trim();

    if media_type.eq_ignore_ascii_case("multipart/related") {
        let start_info = content_type_parameter(content_type, "start-info")?;
        content_type_parameter(&start_info, "action")
    } else {
        content_type_parameter(content_type, "action")
    }
}

/// Looks up a parameter of a content type, honoring quoted strings and backslash escapes.
pub fn content_type_parameter(content_type: &str, name: &str) -> Option<String> {
    split_parameters(content_type).into_iter().skip(1).find_map(|parameter| {
        let (key, value) = parameter.split_once('=')?;
        key.trim().eq_ignore_ascii_case(name).then(|| unescape(value.trim()))
    })
}

fn split_parameters(content_type: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;

    for (index, c) in content_type.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ';' if !quoted => {
                parts.push(&content_type[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&content_type[start..]);
    parts
}

fn unescape(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) else {
        return value.to_string();
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            c => out.push(c),
        }
    }
    out
}

/// Strips one pair of surrounding double quotes.
pub fn unquote(value: &str) -> &str {
    value.strip_prefix('"').and_then(|v| v.strip_suffix('"')).unwrap_or(value)
}

/// Decodes `%XX` escapes. Invalid escapes are kept verbatim.
pub fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let (Some(high), Some(low)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2]))
        {
            out.push(high << 4 | low);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn anonymous_prefixes() {
        let matcher = AnonymousUriPrefixMatcher::new().with_prefix("http://anonymous.local/");
        assert!(matcher.is_anonymous_uri("HTTP://anonymous.local/reply/1"));
        assert!(!matcher.is_anonymous_uri("http://example.com/"));
        assert!(!matcher.is_anonymous_uri("http://anon"));
    }

    #[test]
    fn soap11_action_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(SOAP_ACTION, HeaderValue::from_static("\"urn:orders%2Fcreate\""));
        assert_eq!(
            transport_action(&headers, EnvelopeVersion::Soap11, None).as_deref(),
            Some("urn:orders/create")
        );

        headers.insert(SOAP_ACTION, HeaderValue::from_static("\"\""));
        assert_eq!(transport_action(&headers, EnvelopeVersion::Soap11, None), None);
    }

    #[test]
    fn soap12_action_from_content_type() {
        let headers = HeaderMap::new();
        let content_type = "application/soap+xml; charset=utf-8; action=\"urn:ping\"";
        assert_eq!(transport_action(&headers, EnvelopeVersion::Soap12, Some(content_type)).as_deref(), Some("urn:ping"));
        assert_eq!(transport_action(&headers, EnvelopeVersion::None, Some(content_type)), None);
    }

    #[test]
    fn multipart_action_from_start_info() {
        let content_type =
            r#"multipart/related; type="application/xop+xml"; start-info="application/soap+xml; action=\"urn:upload\"""#;
        assert_eq!(
            transport_action(&HeaderMap::new(), EnvelopeVersion::Soap12, Some(content_type)).as_deref(),
            Some("urn:upload")
        );
    }

    #[test]
    fn percent_decoding_keeps_invalid_escapes() {
        assert_eq!(percent_decode("a%20b"), "a b");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }
}
