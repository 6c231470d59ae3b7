//! 64-bit object identifiers.
//!
//! A device id is the CRC32 of its registered name shifted into the high
//! word; signals and maps fill the low word with a device-local counter, so
//! any object id embeds the id of the device that allocated it.

use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Id(u64);

impl Id {
    /// The unset id.
    pub const NONE: Id = Id(0);

    pub fn from_u64(raw: u64) -> Self {
        Id(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Device id for a registered name, e.g. `"synth.1"`.
    pub fn for_device_name(name: &str) -> Id {
        Id((crc32fast::hash(name.as_bytes()) as u64) << 32)
    }

    /// Child id: the device id with a device-local counter in the low word.
    pub fn child(self, counter: u32) -> Id {
        Id((self.0 & 0xFFFF_FFFF_0000_0000) | counter as u64)
    }

    /// The id of the allocating device (low word cleared).
    pub fn device_part(self) -> Id {
        Id(self.0 & 0xFFFF_FFFF_0000_0000)
    }

    /// The device-local counter in the low word.
    pub fn local_part(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({:#018x})", self.0)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_ids_live_in_the_high_word() {
        let id = Id::for_device_name("synth.1");
        assert_eq!(id.local_part(), 0);
        assert!(!id.is_none());
        assert_eq!(id.device_part(), id);
    }

    #[test]
    fn child_ids_embed_the_device() {
        let dev = Id::for_device_name("synth.1");
        let sig = dev.child(3);
        assert_eq!(sig.device_part(), dev);
        assert_eq!(sig.local_part(), 3);
        assert_ne!(sig, dev.child(4));
    }

    #[test]
    fn distinct_names_give_distinct_ids() {
        assert_ne!(
            Id::for_device_name("synth.1"),
            Id::for_device_name("synth.2")
        );
    }
}
