//! Server side of the WebSocket opening handshake.

use crate::error::TransportError;
use crate::http_channel::ResponseBody;
use crate::settings::WebSocketTransportSettings;
use crate::utils::ensure;
use crate::websocket::WebSocketMessageType;
use http::header::{CONNECTION, COOKIE, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE};
use http::{HeaderMap, HeaderValue, Method, Response, StatusCode, Uri};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

const WEBSOCKET_VERSION: &str = "13";

/// A validated upgrade request, ready to be accepted.
#[derive(Debug)]
pub struct WebSocketUpgrade {
    key: HeaderValue,
    sub_protocol: Option<String>,
    uri: Uri,
    headers: HeaderMap,
}

impl WebSocketUpgrade {
    /// Returns true when the request asks to switch to the websocket protocol.
    pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
        header_contains_token(headers, &CONNECTION, "upgrade") && header_contains_token(headers, &UPGRADE, "websocket")
    }

    pub fn negotiate(
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        settings: &WebSocketTransportSettings,
    ) -> Result<Self, TransportError> {
        ensure!(
            *method == Method::GET,
            TransportError::protocol(StatusCode::METHOD_NOT_ALLOWED, format!("websocket upgrade with method {method}"))
        );
        ensure!(
            Self::is_upgrade_request(headers),
            TransportError::protocol(StatusCode::BAD_REQUEST, "missing websocket upgrade headers")
        );

        let version = headers.get(SEC_WEBSOCKET_VERSION).and_then(|v| v.to_str().ok()).map(str::trim);
        ensure!(
            version == Some(WEBSOCKET_VERSION),
            TransportError::protocol_with_reason(StatusCode::UPGRADE_REQUIRED, "unsupported websocket version")
        );

        let key = headers
            .get(SEC_WEBSOCKET_KEY)
            .cloned()
            .ok_or_else(|| TransportError::protocol(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key"))?;

        let sub_protocol = match settings.sub_protocol() {
            None => None,
            Some(expected) => {
                let offered = headers
                    .get_all(SEC_WEBSOCKET_PROTOCOL)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .flat_map(|v| v.split(','))
                    .map(str::trim)
                    .find(|offered| offered.eq_ignore_ascii_case(expected));

                match offered {
                    Some(_) => Some(expected.to_string()),
                    None => {
                        debug!(expected, "no matching websocket sub-protocol offered");
                        return Err(TransportError::protocol_with_reason(
                            StatusCode::UPGRADE_REQUIRED,
                            format!("sub-protocol {expected} required"),
                        ));
                    }
                }
            }
        };

        Ok(Self { key, sub_protocol, uri: uri.clone(), headers: headers.clone() })
    }

    pub fn sub_protocol(&self) -> Option<&str> {
        self.sub_protocol.as_deref()
    }

    /// Builds the `101 Switching Protocols` response and the context later attached to every
    /// message received over the socket.
    pub fn accept(self) -> Result<(Response<ResponseBody>, WebSocketContext), TransportError> {
        let accept = tungstenite::handshake::derive_accept_key(self.key.as_bytes());

        let mut builder = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "Upgrade")
            .header(SEC_WEBSOCKET_ACCEPT, accept);
        if let Some(sub_protocol) = &self.sub_protocol {
            builder = builder.header(SEC_WEBSOCKET_PROTOCOL, sub_protocol.as_str());
        }

        let response = builder
            .body(ResponseBody::empty())
            .map_err(|e| TransportError::protocol(StatusCode::BAD_REQUEST, format!("invalid handshake response: {e}")))?;

        let context = WebSocketContext {
            inner: Arc::new(ContextInner {
                uri: self.uri,
                headers: self.headers,
                sub_protocol: self.sub_protocol,
                header_view: OnceLock::new(),
                cookies: OnceLock::new(),
                request_uri: OnceLock::new(),
            }),
        };
        Ok((response, context))
    }
}

fn header_contains_token(headers: &HeaderMap, name: &http::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case(token))
}

/// The handshake request, shared by every message of a websocket session.
#[derive(Debug, Clone)]
pub struct WebSocketContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    uri: Uri,
    headers: HeaderMap,
    sub_protocol: Option<String>,
    header_view: OnceLock<BTreeMap<String, Vec<String>>>,
    cookies: OnceLock<Vec<(String, String)>>,
    request_uri: OnceLock<String>,
}

impl WebSocketContext {
    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.inner.headers
    }

    pub fn sub_protocol(&self) -> Option<&str> {
        self.inner.sub_protocol.as_deref()
    }

    /// Header values grouped by lower case name. Values that are not visible ASCII are skipped.
    pub fn header_values(&self) -> &BTreeMap<String, Vec<String>> {
        self.inner.header_view.get_or_init(|| {
            let mut view = BTreeMap::<String, Vec<String>>::new();
            for (name, value) in &self.inner.headers {
                if let Ok(value) = value.to_str() {
                    view.entry(name.as_str().to_string()).or_default().push(value.to_string());
                }
            }
            view
        })
    }

    pub fn cookies(&self) -> &[(String, String)] {
        self.inner.cookies.get_or_init(|| {
            self.inner
                .headers
                .get_all(COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(';'))
                .filter_map(|pair| {
                    let (name, value) = pair.split_once('=')?;
                    let name = name.trim();
                    (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
                })
                .collect()
        })
    }

    /// The absolute request URI, using the `Host` header when the request line was relative.
    pub fn request_uri(&self) -> &str {
        self.inner.request_uri.get_or_init(|| {
            let uri = &self.inner.uri;
            if uri.scheme().is_some() {
                return uri.to_string();
            }
            let path = uri.path_and_query().map_or("/", |p| p.as_str());
            match self.inner.headers.get(HOST).and_then(|v| v.to_str().ok()) {
                Some(host) => format!("ws://{host}{path}"),
                None => path.to_string(),
            }
        })
    }
}

/// Attached to every message received over a websocket.
#[derive(Debug, Clone)]
pub struct WebSocketMessageProperty {
    pub message_type: WebSocketMessageType,
    pub sub_protocol: Option<String>,
    pub context: Option<WebSocketContext>,
}

impl WebSocketMessageProperty {
    pub fn new(message_type: WebSocketMessageType) -> Self {
        Self { message_type, sub_protocol: None, context: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_headers(extra: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("example.com"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers.insert(SEC_WEBSOCKET_KEY, HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="));
        for (name, value) in extra {
            headers.append(*name, HeaderValue::from_static(*value));
        }
        headers
    }

    #[test]
    fn accept_key_and_sub_protocol() {
        let settings = WebSocketTransportSettings::default().with_sub_protocol("soap");
        let headers = upgrade_headers(&[("sec-websocket-protocol", "chat, SOAP")]);
        let uri: Uri = "/service?x=1".parse().unwrap();

        let upgrade = WebSocketUpgrade::negotiate(&Method::GET, &uri, &headers, &settings).unwrap();
        assert_eq!(upgrade.sub_protocol(), Some("soap"));

        let (response, context) = upgrade.accept().unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers()[SEC_WEBSOCKET_ACCEPT], "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(response.headers()[SEC_WEBSOCKET_PROTOCOL], "soap");
        assert_eq!(context.request_uri(), "ws://example.com/service?x=1");
    }

    #[test]
    fn missing_sub_protocol_requires_upgrade() {
        let settings = WebSocketTransportSettings::default().with_sub_protocol("soap");
        let headers = upgrade_headers(&[("sec-websocket-protocol", "chat")]);
        let error = WebSocketUpgrade::negotiate(&Method::GET, &Uri::from_static("/"), &headers, &settings).unwrap_err();
        assert_eq!(error.status_code(), StatusCode::UPGRADE_REQUIRED);
    }

    #[test]
    fn rejects_wrong_method_and_version() {
        let settings = WebSocketTransportSettings::default();
        let headers = upgrade_headers(&[]);
        assert!(WebSocketUpgrade::negotiate(&Method::POST, &Uri::from_static("/"), &headers, &settings).is_err());

        let mut headers = upgrade_headers(&[]);
        headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
        let error = WebSocketUpgrade::negotiate(&Method::GET, &Uri::from_static("/"), &headers, &settings).unwrap_err();
        assert_eq!(error.status_code(), StatusCode::UPGRADE_REQUIRED);
    }

    #[test]
    fn context_views_are_computed_once() {
        let settings = WebSocketTransportSettings::default();
        let headers = upgrade_headers(&[("cookie", "a=1; b = two"), ("cookie", "c=3")]);
        let upgrade = WebSocketUpgrade::negotiate(&Method::GET, &Uri::from_static("/"), &headers, &settings).unwrap();
        let (_, context) = upgrade.accept().unwrap();

        let cookies = context.cookies();
        assert_eq!(cookies.len(), 3);
        assert_eq!(cookies[1], ("b".to_string(), "two".to_string()));
        assert!(std::ptr::eq(cookies, context.clone().cookies()));
        assert_eq!(context.header_values()["cookie"].len(), 2);
    }
}
