//! Envelope and addressing versions a [`Message`](super::Message) is written in.

use std::fmt;

/// The SOAP envelope a message is framed in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EnvelopeVersion {
    /// No envelope, the body travels on its own (plain HTTP / POX style).
    None,
    Soap11,
    Soap12,
}

/// The WS-Addressing flavour used for the addressing headers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AddressingVersion {
    /// Addressing headers never appear on the wire; transport metadata supplies them.
    None,
    WsAddressingAugust2004,
    WsAddressing10,
}

impl AddressingVersion {
    /// The well known anonymous destination of this addressing version.
    pub fn anonymous_uri(&self) -> &'static str {
        match self {
            AddressingVersion::None => "http://schemas.microsoft.com/2005/12/ServiceModel/Addressing/Anonymous",
            AddressingVersion::WsAddressingAugust2004 => "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous",
            AddressingVersion::WsAddressing10 => "http://www.w3.org/2005/08/addressing/anonymous",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, AddressingVersion::None)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MessageVersion {
    envelope: EnvelopeVersion,
    addressing: AddressingVersion,
}

impl MessageVersion {
    pub const NONE: MessageVersion = MessageVersion::new(EnvelopeVersion::None, AddressingVersion::None);
    pub const SOAP11: MessageVersion = MessageVersion::new(EnvelopeVersion::Soap11, AddressingVersion::None);
    pub const SOAP12: MessageVersion = MessageVersion::new(EnvelopeVersion::Soap12, AddressingVersion::None);
    pub const SOAP11_WSA_AUGUST_2004: MessageVersion =
        MessageVersion::new(EnvelopeVersion::Soap11, AddressingVersion::WsAddressingAugust2004);
    pub const SOAP11_WSA10: MessageVersion = MessageVersion::new(EnvelopeVersion::Soap11, AddressingVersion::WsAddressing10);
    pub const SOAP12_WSA_AUGUST_2004: MessageVersion =
        MessageVersion::new(EnvelopeVersion::Soap12, AddressingVersion::WsAddressingAugust2004);
    pub const SOAP12_WSA10: MessageVersion = MessageVersion::new(EnvelopeVersion::Soap12, AddressingVersion::WsAddressing10);

    pub const fn new(envelope: EnvelopeVersion, addressing: AddressingVersion) -> Self {
        Self { envelope, addressing }
    }

    #[inline]
    pub fn envelope(&self) -> EnvelopeVersion {
        self.envelope
    }

    #[inline]
    pub fn addressing(&self) -> AddressingVersion {
        self.addressing
    }

    /// The null version has no notion of an empty message, so a bodiless request maps to a
    /// placeholder message instead of a bad request.
    #[inline]
    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl Default for MessageVersion {
    fn default() -> Self {
        Self::SOAP12_WSA10
    }
}

impl fmt::Display for MessageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.envelope, self.addressing)
    }
}
