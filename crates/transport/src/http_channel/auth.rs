use crate::error::TransportError;
use crate::settings::AuthenticationScheme;
use async_trait::async_trait;
use http::{HeaderMap, Method, Uri};

/// Who sent a request, as established by an [`Authenticator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContext {
    pub scheme: AuthenticationScheme,
    pub identity: Option<String>,
}

impl SecurityContext {
    pub fn anonymous() -> Self {
        Self { scheme: AuthenticationScheme::Anonymous, identity: None }
    }
}

/// Carries the [`SecurityContext`] of the request on the received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityMessageProperty {
    pub context: SecurityContext,
}

/// Validates the credentials of a request before its body is read.
///
/// A failure is answered locally with its status code, or 403 when it carries none, and never
/// reaches the dispatcher.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, method: &Method, uri: &Uri, headers: &HeaderMap) -> Result<SecurityContext, TransportError>;
}

/// Accepts every request as anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousAuthenticator;

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    async fn authenticate(&self, _method: &Method, _uri: &Uri, _headers: &HeaderMap) -> Result<SecurityContext, TransportError> {
        Ok(SecurityContext::anonymous())
    }
}
