use std::convert::From;
use std::fmt::{self, Display};

/// Locally unique identifier of a network interface (`NET_LUID`).
///
/// The 64-bit value packs the interface type into the top 16 bits and the per-type
/// interface index into bits 24..48; the low 24 bits are reserved.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct IfLuid(u64);

impl IfLuid {
    /// Returns the raw 64-bit value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns the interface type (`IFTYPE`), e.g. 53 for a proprietary virtual adapter.
    pub fn if_type(&self) -> u16 {
        (self.0 >> 48) as u16
    }

    /// Returns the interface index within its type.
    pub fn net_luid_index(&self) -> u32 {
        ((self.0 >> 24) & 0xFF_FFFF) as u32
    }
}

/// Implements the conversion from a raw `NET_LUID` value.
///
/// # Examples
///
/// ```
/// use wintunapi::IfLuid;
///
/// let luid = IfLuid::from((53u64 << 48) | (7u64 << 24));
/// assert_eq!(luid.if_type(), 53);
/// assert_eq!(luid.net_luid_index(), 7);
/// assert_eq!(luid, IfLuid::from(luid.value()));
/// ```
impl From<u64> for IfLuid {
    fn from(value: u64) -> Self {
        IfLuid(value)
    }
}

impl From<IfLuid> for u64 {
    fn from(val: IfLuid) -> Self {
        val.0
    }
}

#[cfg(windows)]
impl From<windows::Win32::NetworkManagement::Ndis::NET_LUID_LH> for IfLuid {
    fn from(luid: windows::Win32::NetworkManagement::Ndis::NET_LUID_LH) -> Self {
        // SAFETY: every bit pattern of the union is a valid u64.
        IfLuid(unsafe { luid.Value })
    }
}

/// The display representation shows the raw value enclosed in parentheses.
impl Display for IfLuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IfLuid({})", self.0)
    }
}
