use std::ops::{BitAnd, BitOr, BitOrAssign};

/// A chat-service permission bitset. Bit layout mirrors the upstream
/// service's permission flags; only the handful of bits the evaluator
/// (spec §4.E) and ingestion controller need are named here, matching the
/// pack's convention of small bitflag newtypes (e.g.
/// `CallReducerFlags` in `client-api-messages`) rather than an exhaustive
/// enum of every upstream flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions(pub u64);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const ALL: Permissions = Permissions(u64::MAX);

    pub const VIEW_CHANNEL: Permissions = Permissions(1 << 10);
    pub const MANAGE_THREADS: Permissions = Permissions(1 << 34);
    pub const ADMINISTRATOR: Permissions = Permissions(1 << 3);

    pub fn has(self, flag: Permissions) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn union(self, other: Permissions) -> Permissions {
        Permissions(self.0 | other.0)
    }

    pub fn deny(self, flag: Permissions) -> Permissions {
        Permissions(self.0 & !flag.0)
    }
}

impl BitOr for Permissions {
    type Output = Permissions;
    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl BitOrAssign for Permissions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Permissions {
    type Output = Permissions;
    fn bitand(self, rhs: Self) -> Self::Output {
        Permissions(self.0 & rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_checks_all_bits_of_flag() {
        let p = Permissions::VIEW_CHANNEL | Permissions::MANAGE_THREADS;
        assert!(p.has(Permissions::VIEW_CHANNEL));
        assert!(p.has(Permissions::MANAGE_THREADS));
        assert!(!p.has(Permissions::ADMINISTRATOR));
    }

    #[test]
    fn deny_clears_only_named_bits() {
        let p = Permissions::VIEW_CHANNEL | Permissions::MANAGE_THREADS;
        let denied = p.deny(Permissions::VIEW_CHANNEL);
        assert!(!denied.has(Permissions::VIEW_CHANNEL));
        assert!(denied.has(Permissions::MANAGE_THREADS));
    }
}
