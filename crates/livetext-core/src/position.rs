//! Dense, totally ordered positions for sequence elements
//!
//! A [`Position`] is a path of `(digit, site, clock)` identifiers compared lexicographically,
//! with a strict prefix sorting before its extensions. New positions are allocated between two
//! neighbours without coordination: when the neighbours leave no room at the current depth
//! the path grows by one level.
//!
//! The last identifier of an allocated position carries the allocating site and a clock value
//! that site never hands out twice. Two allocations therefore never produce the same position,
//! even when one site types again into a gap it just emptied.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identifies the replica (author) allocating positions
pub type SiteId = u32;

/// Exclusive upper bound for digits at every depth
pub const BASE: u32 = 1 << 16;

/// Largest step taken above the lower neighbour when a level has room
const BOUNDARY: u32 = 10;

/// Logical clock of a replica; strictly increases with every allocation it makes
pub type Clock = u32;

/// One level of a position path
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub digit: u32,
    pub site: SiteId,
    pub clock: Clock,
}

impl Identifier {
    pub fn new(digit: u32, site: SiteId, clock: Clock) -> Self {
        Self { digit, site, clock }
    }
}

/// Globally unique, densely ordered identifier of a symbol
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(Vec<Identifier>);

impl Position {
    pub fn new(identifiers: Vec<Identifier>) -> Self {
        Self(identifiers)
    }

    pub fn identifiers(&self) -> &[Identifier] {
        &self.0
    }

    /// Number of levels in the path
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Site that allocated this position
    pub fn site(&self) -> Option<SiteId> {
        self.0.last().map(|id| id.site)
    }

    /// Largest clock value anywhere in the path
    pub fn max_clock(&self) -> Clock {
        self.0.iter().map(|id| id.clock).max().unwrap_or_default()
    }

    /// Allocate a position strictly between `before` and `after`.
    ///
    /// An absent neighbour stands for the matching open end of the sequence.
    pub fn between(
        before: Option<&Position>,
        after: Option<&Position>,
        site: SiteId,
        clock: Clock,
    ) -> Result<Self> {
        allocate(before, after, site, clock)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}@{}:{}", id.digit, id.site, id.clock)?;
        }
        write!(f, "]")
    }
}

/// Allocate a position strictly between `before` and `after` on behalf of `site`.
///
/// `clock` must be a value `site` has not used for an earlier allocation.
pub fn allocate(
    before: Option<&Position>,
    after: Option<&Position>,
    site: SiteId,
    clock: Clock,
) -> Result<Position> {
    let invalid = || Error::InvalidBounds {
        before: before.cloned().unwrap_or_default(),
        after: after.cloned().unwrap_or_default(),
    };

    if let (Some(b), Some(a)) = (before, after) {
        if b >= a {
            return Err(invalid());
        }
    }

    let lower = before.map_or(&[][..], |p| p.identifiers());
    let upper = after.map(|p| p.identifiers());

    let mut path = Vec::with_capacity(lower.len() + 1);
    if descend(lower, upper, Identifier::new(0, site, clock), &mut path) {
        Ok(Position(path))
    } else {
        Err(invalid())
    }
}

/// Walk both neighbours level by level until a level leaves room for a fresh digit.
///
/// `upper == None` means the upper bound is open from this level on. `fresh` carries the
/// allocating site and clock. Returns false when no position exists below `upper`, which
/// only happens for hand-built bounds.
fn descend(
    mut lower: &[Identifier],
    mut upper: Option<&[Identifier]>,
    fresh: Identifier,
    path: &mut Vec<Identifier>,
) -> bool {
    loop {
        let lo = lower.first().copied();
        let hi = match upper {
            Some(ids) => match ids.first() {
                Some(id) => Some(*id),
                None => return false,
            },
            None => None,
        };

        let lo_digit = lo.map_or(0, |id| id.digit);
        let hi_digit = hi.map_or(BASE, |id| id.digit);

        if hi_digit.saturating_sub(lo_digit) > 1 {
            let step = ((hi_digit - lo_digit) / 2).clamp(1, BOUNDARY);
            path.push(Identifier {
                digit: lo_digit + step,
                ..fresh
            });
            return true;
        }

        match (lo, hi) {
            (Some(lo_id), _) => {
                path.push(lo_id);
                lower = &lower[1..];
                upper = match (hi, upper) {
                    (Some(hi_id), Some(ids)) if hi_id == lo_id => Some(&ids[1..]),
                    _ => None,
                };
            }
            (None, Some(hi_id)) if hi_id.digit >= 1 => {
                // Anything under a zero filler sorts below the upper neighbour.
                path.push(fresh);
                upper = None;
            }
            (None, Some(hi_id)) => {
                path.push(hi_id);
                upper = upper.map(|ids| &ids[1..]);
            }
            (None, None) => unreachable!("an open level always has room"),
        }
    }
}
