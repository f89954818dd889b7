use http::Extensions;
use std::fmt;

/// A typed property bag travelling with a [`Message`](super::Message).
///
/// Every property is keyed by its type, so transports define their own property structs
/// (request metadata, response status, remote endpoint, ...) and look them up without any
/// string keys or downcasting at the call site.
#[derive(Default, Clone)]
pub struct MessageProperties {
    inner: Extensions,
}

impl MessageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a property, returning the previous one of the same type.
    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.inner.insert(value)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.inner.get::<T>()
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.inner.get_mut::<T>()
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.inner.remove::<T>()
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.inner.get::<T>().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Copies every property of `other` into this bag, overriding properties of the same type.
    pub fn extend(&mut self, other: MessageProperties) {
        self.inner.extend(other.inner);
    }
}

impl fmt::Debug for MessageProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageProperties").field("len", &self.inner.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Marker(u32);

    #[test]
    fn typed_lookup_and_replace() {
        let mut properties = MessageProperties::new();
        assert!(properties.insert(Marker(1)).is_none());
        assert_eq!(properties.insert(Marker(2)), Some(Marker(1)));
        assert_eq!(properties.get::<Marker>(), Some(&Marker(2)));
        assert!(!properties.contains::<String>());

        assert_eq!(properties.remove::<Marker>(), Some(Marker(2)));
        assert!(properties.is_empty());
    }
}
