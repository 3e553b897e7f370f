use std::{fmt, ops};

/// Access rights of a connection endpoint, mirroring the registration flags
/// of a remotely accessible memory region. The handoff protocol toggles the
/// remote flags to move write authority between replicas.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Rights(u8);

impl Rights {
    /// Local reads of the region.
    pub const LOCAL_READ: Self = Self(1);
    /// Local writes to the region.
    pub const LOCAL_WRITE: Self = Self(1 << 1);
    /// One-sided reads issued by the peer.
    pub const REMOTE_READ: Self = Self(1 << 2);
    /// One-sided writes issued by the peer.
    pub const REMOTE_WRITE: Self = Self(1 << 3);

    /// Local access only; the peer can neither read nor write.
    pub fn local() -> Self {
        Self::LOCAL_READ | Self::LOCAL_WRITE
    }

    /// Full local and remote access.
    pub fn full() -> Self {
        Self::local() | Self::REMOTE_READ | Self::REMOTE_WRITE
    }

    /// Whether all rights in `other` are present in `self`.
    pub fn allows(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit form, for storage in an atomic cell.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Reconstructs rights from their raw bit form.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0xf)
    }
}

impl ops::BitOr for Rights {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Rights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = [
            (Self::LOCAL_READ, "lr"),
            (Self::LOCAL_WRITE, "lw"),
            (Self::REMOTE_READ, "rr"),
            (Self::REMOTE_WRITE, "rw"),
        ];
        let mut first = true;
        for (flag, name) in flags {
            if self.allows(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}
