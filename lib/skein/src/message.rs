use crate::handle::ServiceHandle;
use std::fmt;

/// Protocol tag selecting the service-level decoder for a message. The set
/// is open: services may agree on tags beyond the built-in ones.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct ProtocolType(pub u8);

impl ProtocolType {
    pub const TEXT: ProtocolType = ProtocolType(0);
    pub const RESPONSE: ProtocolType = ProtocolType(1);
    pub const MULTICAST: ProtocolType = ProtocolType(2);
    pub const CLIENT: ProtocolType = ProtocolType(3);
    pub const SYSTEM: ProtocolType = ProtocolType(4);
    pub const HARBOR: ProtocolType = ProtocolType(5);
    pub const SOCKET: ProtocolType = ProtocolType(6);
    pub const ERROR: ProtocolType = ProtocolType(7);
    pub const TIMER: ProtocolType = ProtocolType(8);
    pub const DEBUG: ProtocolType = ProtocolType(9);
    pub const LUA: ProtocolType = ProtocolType(10);
    pub const SNAX: ProtocolType = ProtocolType(11);
    pub const TRACE: ProtocolType = ProtocolType(12);

    pub fn name(self) -> &'static str {
        match self {
            ProtocolType::TEXT => "text",
            ProtocolType::RESPONSE => "response",
            ProtocolType::MULTICAST => "multicast",
            ProtocolType::CLIENT => "client",
            ProtocolType::SYSTEM => "system",
            ProtocolType::HARBOR => "harbor",
            ProtocolType::SOCKET => "socket",
            ProtocolType::ERROR => "error",
            ProtocolType::TIMER => "timer",
            ProtocolType::DEBUG => "debug",
            ProtocolType::LUA => "lua",
            ProtocolType::SNAX => "snax",
            ProtocolType::TRACE => "trace",
            _ => "user",
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

impl fmt::Debug for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Message payload with single-owner semantics. `Owned` moves the buffer
/// into the message (the original's DONT_COPY transfer); `Static` borrows
/// process-lifetime bytes (DONT_FREE). Dropping the message releases an
/// owned buffer exactly once.
pub enum Payload {
    Empty,
    Owned(Box<[u8]>),
    Static(&'static [u8]),
}

impl Payload {
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Empty => &[],
            Payload::Owned(data) => data,
            Payload::Static(data) => data,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extract the bytes, copying only when the payload is borrowed.
    #[inline]
    pub fn into_bytes(self) -> Box<[u8]> {
        match self {
            Payload::Empty => Box::from(&[][..]),
            Payload::Owned(data) => data,
            Payload::Static(data) => Box::from(data),
        }
    }

    pub fn text(&self) -> std::borrow::Cow<str> {
        String::from_utf8_lossy(self.as_bytes())
    }
}

impl From<Vec<u8>> for Payload {
    #[inline]
    fn from(data: Vec<u8>) -> Payload {
        Payload::Owned(data.into_boxed_slice())
    }
}

impl From<String> for Payload {
    #[inline]
    fn from(data: String) -> Payload {
        Payload::Owned(data.into_bytes().into_boxed_slice())
    }
}

impl From<&'static [u8]> for Payload {
    #[inline]
    fn from(data: &'static [u8]) -> Payload {
        Payload::Static(data)
    }
}

impl From<&'static str> for Payload {
    #[inline]
    fn from(data: &'static str) -> Payload {
        Payload::Static(data.as_bytes())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Payload::Empty => write!(f, "Payload::Empty"),
            Payload::Owned(data) => write!(f, "Payload::Owned({} bytes)", data.len()),
            Payload::Static(data) => write!(f, "Payload::Static({} bytes)", data.len()),
        }
    }
}

/// A queued message. The destination is not stored: once a message sits in
/// a mailbox the owning service is implied.
#[derive(Debug)]
pub struct Message {
    /// Sender, or zero for runtime-synthesized messages.
    pub source: ServiceHandle,
    /// Request/response correlation token; 0 means fire-and-forget.
    pub session: i32,
    pub protocol: ProtocolType,
    pub payload: Payload,
}

impl Message {
    #[inline]
    pub fn system(source: ServiceHandle, payload: Payload) -> Message {
        Message {
            source,
            session: 0,
            protocol: ProtocolType::SYSTEM,
            payload,
        }
    }

    /// Error reply carrying a failed session back to its originator.
    #[inline]
    pub fn error_reply(session: i32) -> Message {
        Message {
            source: ServiceHandle::ZERO,
            session,
            protocol: ProtocolType::ERROR,
            payload: Payload::Empty,
        }
    }

    /// Timeout expiry notification.
    #[inline]
    pub fn timer(session: i32) -> Message {
        Message {
            source: ServiceHandle::ZERO,
            session,
            protocol: ProtocolType::TIMER,
            payload: Payload::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_ownership_forms() {
        let owned = Payload::from(vec![1u8, 2, 3]);
        assert_eq!(owned.as_bytes(), &[1, 2, 3]);

        let fixed = Payload::from("abc");
        assert_eq!(fixed.as_bytes(), b"abc");
        assert_eq!(fixed.len(), 3);

        assert!(Payload::Empty.is_empty());
    }

    #[test]
    fn test_into_bytes_moves_owned() {
        let payload = Payload::from(vec![9u8; 16]);
        let bytes = payload.into_bytes();
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn test_protocol_names() {
        assert_eq!(ProtocolType::SOCKET.name(), "socket");
        assert_eq!(ProtocolType(200).name(), "user");
        assert_eq!(format!("{}", ProtocolType::LUA), "lua(10)");
    }

    #[test]
    fn test_error_reply_shape() {
        let msg = Message::error_reply(77);
        assert_eq!(msg.protocol, ProtocolType::ERROR);
        assert_eq!(msg.session, 77);
        assert!(msg.source.is_zero());
    }
}
