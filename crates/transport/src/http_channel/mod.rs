//! Request/reply messaging over plain HTTP.
//!
//! A request flows through [`HttpTransportHandler`] into an [`HttpRequestContext`], which owns the
//! [`HttpInput`] parsing the body into a message and the [`HttpOutput`] writing the reply. The host
//! server is only seen through [`HttpRequestSource`] and [`HttpResponseSink`].

mod auth;
mod context;
mod environment;
mod handler;
mod input;
mod output;
mod request;
mod response;

pub use auth::{AnonymousAuthenticator, Authenticator, SecurityContext, SecurityMessageProperty};
pub use context::{HttpRequestContext, RequestContextState};
pub use environment::{HttpRequestSource, HttpResponseSink, ResponseHead, ResponseWriter};
pub use handler::{
    Dispatcher, DispatcherFn, DuplexDispatcher, DuplexDispatcherFn, HttpTransportHandler, PendingUpgrade, UpgradedStream,
    make_dispatcher, make_duplex_dispatcher,
};
pub use input::{HttpInput, IncomingMessage};
pub use output::HttpOutput;
pub use request::{HttpRequest, HttpRequestMessageProperty, RemoteEndpointMessageProperty};
pub use response::{
    ChannelBody, ChannelResponseSink, HttpResponseMessageProperty, ResponseBody, ResponseReceiver, StatusDescription,
    response_channel,
};
