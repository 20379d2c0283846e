/// Base lock modes shared by key locks, gap locks and intent locks.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum BaseMode {
    N = 0,
    IS = 1,
    IX = 2,
    S = 3,
    SIX = 4,
    X = 5,
}

/// Standard compatibility matrix.
const COMPAT: [[bool; 6]; 6] = [
    // N     IS     IX     S      SIX    X
    [true, true, true, true, true, true],    // N
    [true, true, true, true, true, false],   // IS
    [true, true, true, false, false, false], // IX
    [true, true, false, true, false, false], // S
    [true, true, false, false, false, false], // SIX
    [true, false, false, false, false, false], // X
];

/// Supremum (least mode covering both) for upgrades.
const SUP: [[BaseMode; 6]; 6] = {
    use BaseMode::*;
    [
        [N, IS, IX, S, SIX, X],
        [IS, IS, IX, S, SIX, X],
        [IX, IX, IX, SIX, SIX, X],
        [S, S, SIX, S, SIX, X],
        [SIX, SIX, SIX, SIX, SIX, X],
        [X, X, X, X, X, X],
    ]
};

impl BaseMode {
    pub fn compatible(self, other: BaseMode) -> bool {
        COMPAT[self as usize][other as usize]
    }

    pub fn sup(self, other: BaseMode) -> BaseMode {
        SUP[self as usize][other as usize]
    }

    pub fn implied_by(self, other: BaseMode) -> bool {
        other.sup(self) == other
    }
}

/// An OKVL lock mode: orthogonal modes for the key itself and for the
/// gap to the next key.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct OkvlMode {
    pub key: BaseMode,
    pub gap: BaseMode,
}

impl OkvlMode {
    pub const N_N: OkvlMode = OkvlMode {
        key: BaseMode::N,
        gap: BaseMode::N,
    };
    /// Shared on the key, nothing on the gap: point read.
    pub const S_N: OkvlMode = OkvlMode {
        key: BaseMode::S,
        gap: BaseMode::N,
    };
    /// Exclusive on the key: insert/update/delete of that key.
    pub const X_N: OkvlMode = OkvlMode {
        key: BaseMode::X,
        gap: BaseMode::N,
    };
    /// Exclusive on the gap before the key: phantom protection for an
    /// insert between this key and its predecessor.
    pub const N_X: OkvlMode = OkvlMode {
        key: BaseMode::N,
        gap: BaseMode::X,
    };
    pub const S_S: OkvlMode = OkvlMode {
        key: BaseMode::S,
        gap: BaseMode::S,
    };

    pub fn compatible(self, other: OkvlMode) -> bool {
        self.key.compatible(other.key) && self.gap.compatible(other.gap)
    }

    pub fn sup(self, other: OkvlMode) -> OkvlMode {
        OkvlMode {
            key: self.key.sup(other.key),
            gap: self.gap.sup(other.gap),
        }
    }

    pub fn is_empty(self) -> bool {
        self == OkvlMode::N_N
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_gap_orthogonality() {
        // X on a key does not conflict with X on the gap of the same id
        assert!(OkvlMode::X_N.compatible(OkvlMode::N_X));
        assert!(!OkvlMode::X_N.compatible(OkvlMode::S_N));
        assert!(!OkvlMode::X_N.compatible(OkvlMode::X_N));
        assert!(OkvlMode::S_N.compatible(OkvlMode::S_S));
    }

    #[test]
    fn test_sup() {
        assert_eq!(OkvlMode::S_N.sup(OkvlMode::N_X), OkvlMode {
            key: BaseMode::S,
            gap: BaseMode::X
        });
        assert_eq!(BaseMode::IS.sup(BaseMode::IX), BaseMode::IX);
        assert_eq!(BaseMode::S.sup(BaseMode::IX), BaseMode::SIX);
    }
}
