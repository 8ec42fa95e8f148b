use std::fmt;
use std::str::FromStr;

/// Addressable identity of a service. The low 24 bits are a node-local
/// serial; the high 8 bits carry the node id used as an opaque routing
/// prefix (0 means "this node" on a standalone deployment).
///
/// Zero is never allocated: as a source it marks runtime-synthesized
/// messages, as a destination it means "drop".
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct ServiceHandle(u32);

impl ServiceHandle {
    pub const SERIAL_MASK: u32 = 0x00ff_ffff;
    pub const NODE_SHIFT: u32 = 24;

    /// The "no service" sentinel.
    pub const ZERO: ServiceHandle = ServiceHandle(0);

    #[inline]
    pub fn new(node: u8, serial: u32) -> ServiceHandle {
        ServiceHandle(u32::from(node) << Self::NODE_SHIFT | (serial & Self::SERIAL_MASK))
    }

    #[inline]
    pub fn from_raw(raw: u32) -> ServiceHandle {
        ServiceHandle(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn serial(self) -> u32 {
        self.0 & Self::SERIAL_MASK
    }

    #[inline]
    pub fn node(self) -> u8 {
        (self.0 >> Self::NODE_SHIFT) as u8
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// True when the handle routes to another node and must go through the
    /// cluster stub rather than the local registry.
    #[inline]
    pub fn is_remote(self, local_node: u8) -> bool {
        let node = self.node();
        node != 0 && node != local_node
    }

    /// Text form used by address-returning commands: `:hhhhhhhh`.
    #[inline]
    pub fn to_text(self) -> String {
        format!(":{:08x}", self.0)
    }
}

impl fmt::Display for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, ":{:08x}", self.0)
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ServiceHandle(:{:08x})", self.0)
    }
}

impl FromStr for ServiceHandle {
    type Err = ();

    fn from_str(s: &str) -> Result<ServiceHandle, ()> {
        match s.as_bytes().first() {
            Some(b':') if s.len() > 1 => u32::from_str_radix(&s[1..], 16)
                .map(ServiceHandle)
                .map_err(drop),
            _ => Err(()),
        }
    }
}

/// Scope of a service name as determined by its prefix character.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NameScope<'a> {
    /// `.name` — visible on this node only.
    Local(&'a str),
    /// `@name` — exported through the cluster stub.
    Global(&'a str),
    /// `:hhhhhhhh` — not a name at all, a literal address.
    Address(ServiceHandle),
}

impl<'a> NameScope<'a> {
    pub fn parse(name: &'a str) -> Option<NameScope<'a>> {
        match name.as_bytes().first()? {
            b'.' => Some(NameScope::Local(&name[1..])),
            b'@' => Some(NameScope::Global(&name[1..])),
            b':' => name.parse().ok().map(NameScope::Address),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let handle = ServiceHandle::new(5, 0x00be_ef01);
        assert_eq!(handle.node(), 5);
        assert_eq!(handle.serial(), 0x00be_ef01);
        assert_eq!(handle.raw(), 0x05be_ef01);
    }

    #[test]
    fn test_serial_masked_to_24_bits() {
        let handle = ServiceHandle::new(1, 0xff00_0002);
        assert_eq!(handle.serial(), 2);
        assert_eq!(handle.node(), 1);
    }

    #[test]
    fn test_text_roundtrip() {
        let handle = ServiceHandle::new(0, 0x1234ab);
        assert_eq!(handle.to_text(), ":001234ab");
        assert_eq!(":001234ab".parse::<ServiceHandle>().unwrap(), handle);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("001234ab".parse::<ServiceHandle>().is_err());
        assert!(":".parse::<ServiceHandle>().is_err());
        assert!(":zzz".parse::<ServiceHandle>().is_err());
    }

    #[test]
    fn test_remote_detection() {
        assert!(!ServiceHandle::new(0, 1).is_remote(3));
        assert!(!ServiceHandle::new(3, 1).is_remote(3));
        assert!(ServiceHandle::new(7, 1).is_remote(3));
    }

    #[test]
    fn test_name_scopes() {
        assert_eq!(NameScope::parse(".gate"), Some(NameScope::Local("gate")));
        assert_eq!(NameScope::parse("@world"), Some(NameScope::Global("world")));
        assert_eq!(
            NameScope::parse(":00000010"),
            Some(NameScope::Address(ServiceHandle::from_raw(0x10)))
        );
        assert_eq!(NameScope::parse("gate"), None);
        assert_eq!(NameScope::parse(""), None);
    }
}
