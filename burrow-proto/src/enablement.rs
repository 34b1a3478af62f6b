//! Enablement bits tagging optional subsystems and revert scopes.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// A subsystem was enabled twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("enablement {0} set twice")]
pub struct EnablementError(pub Enablement);

/// A set of enablement bits.
///
/// The low four bits denote optional subsystems integrated into the
/// sandbox; [`Enablement::USER`] and [`Enablement::PROCESS`] are revert
/// scopes tagging host ops that outlive or die with a single instance.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Enablement(u8);

impl Enablement {
    /// Wayland display server access.
    pub const WAYLAND: Self = Self(1 << 0);
    /// X11 display server access.
    pub const X11: Self = Self(1 << 1);
    /// D-Bus session (and optionally system) bus access.
    pub const DBUS: Self = Self(1 << 2);
    /// PulseAudio server access.
    pub const PULSE: Self = Self(1 << 3);
    /// Reverted only at final instance exit.
    pub const USER: Self = Self(1 << 4);
    /// Unconditionally reverted on instance exit.
    pub const PROCESS: Self = Self(1 << 5);

    /// All optional-subsystem bits, excluding revert scopes.
    pub const FEATURES: Self = Self(0b1111);

    const NAMES: [(Self, &'static str); 6] = [
        (Self::WAYLAND, "wayland"),
        (Self::X11, "x11"),
        (Self::DBUS, "dbus"),
        (Self::PULSE, "pulseaudio"),
        (Self::USER, "user"),
        (Self::PROCESS, "process"),
    ];

    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns the intersection of the two sets.
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Returns `self` with every bit of `other` removed.
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Sets `bit`, failing loudly when it is already set.
    pub fn set(&mut self, bit: Self) -> Result<(), EnablementError> {
        if self.contains(bit) {
            return Err(EnablementError(bit));
        }
        self.0 |= bit.0;
        Ok(())
    }
}

impl BitOr for Enablement {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Enablement {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Enablement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(no enablements)");
        }
        let mut first = true;
        for (bit, name) in Self::NAMES {
            if self.contains(bit) {
                if !first {
                    f.write_str(", ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_fixed_order() {
        let e = Enablement::PULSE | Enablement::WAYLAND;
        assert_eq!(e.to_string(), "wayland, pulseaudio");
        assert_eq!(Enablement::empty().to_string(), "(no enablements)");
        assert_eq!(
            (Enablement::X11 | Enablement::PROCESS).to_string(),
            "x11, process"
        );
    }

    #[test]
    fn double_set_fails() {
        let mut e = Enablement::empty();
        e.set(Enablement::DBUS).unwrap();
        assert_eq!(
            e.set(Enablement::DBUS),
            Err(EnablementError(Enablement::DBUS))
        );
        e.set(Enablement::X11).unwrap();
        assert!(e.contains(Enablement::DBUS | Enablement::X11));
    }

    #[test]
    fn difference_removes_bits() {
        let e = Enablement::FEATURES;
        let d = e.difference(Enablement::WAYLAND | Enablement::DBUS);
        assert_eq!(d, Enablement::X11 | Enablement::PULSE);
    }
}
