//! Per-object reference bookkeeping

use std::fmt;

use ahash::AHashMap;

/// Stable identity of a managed object.
///
/// Identities are handed out monotonically by the heap and never reused, so
/// a stale id can be detected instead of silently aliasing a newer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side of an edge a degree update applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// References held by others toward this object.
    Incoming,
    /// References this object holds toward others.
    Outgoing,
}

/// The collector's per-object ledger.
///
/// Tracks, for one managed object, every incoming strong edge keyed by
/// referrer, every outgoing strong edge keyed by target, and the number of
/// external (rooted) references. An object is locally alive while
/// `in_degree() > 0`; whether it is *actually* alive additionally depends on
/// reachability from the root set, which is the sweep's concern, not this
/// ledger's.
#[derive(Debug, Default)]
pub struct Descriptor {
    /// Incoming strong edges, referrer id → count.
    ref_in: AHashMap<ObjectId, u32>,
    /// Outgoing strong edges, target id → count, in first-acquisition order.
    /// Order is observable through deterministic teardown, so this stays a
    /// vector rather than a map.
    ref_out: Vec<(ObjectId, u32)>,
    /// External references; conceptually `ref_in` keyed by the synthetic
    /// root referrer.
    root_refs: u32,
}

impl Descriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more reference in the given direction.
    ///
    /// A `None` referrer means "root" and is only meaningful for
    /// [`Direction::Incoming`]. Never fails; saturating rather than wrapping
    /// keeps a miscounting bug from manufacturing free objects.
    pub fn incr(&mut self, direction: Direction, referrer: Option<ObjectId>) {
        match (direction, referrer) {
            (Direction::Incoming, None) => {
                self.root_refs = self.root_refs.saturating_add(1);
            }
            (Direction::Incoming, Some(id)) => {
                *self.ref_in.entry(id).or_insert(0) += 1;
            }
            (Direction::Outgoing, Some(id)) => {
                if let Some(slot) = self.ref_out.iter_mut().find(|(t, _)| *t == id) {
                    slot.1 += 1;
                } else {
                    self.ref_out.push((id, 1));
                }
            }
            (Direction::Outgoing, None) => {
                debug_assert!(false, "outgoing edges always have a referrer");
            }
        }
    }

    /// Remove one reference in the given direction.
    ///
    /// Returns `true` iff a matching entry with a nonzero count existed and
    /// was decremented. `false` signals a reference that was dropped twice or
    /// never acquired; callers treat it as a logic error, not as a valid
    /// empty decrement.
    pub fn decr(&mut self, direction: Direction, referrer: Option<ObjectId>) -> bool {
        match (direction, referrer) {
            (Direction::Incoming, None) => {
                if self.root_refs == 0 {
                    return false;
                }
                self.root_refs -= 1;
                true
            }
            (Direction::Incoming, Some(id)) => {
                let Some(count) = self.ref_in.get_mut(&id) else {
                    return false;
                };
                *count -= 1;
                if *count == 0 {
                    self.ref_in.remove(&id);
                }
                true
            }
            (Direction::Outgoing, Some(id)) => {
                let Some(pos) = self.ref_out.iter().position(|(t, _)| *t == id) else {
                    return false;
                };
                self.ref_out[pos].1 -= 1;
                if self.ref_out[pos].1 == 0 {
                    self.ref_out.remove(pos);
                }
                true
            }
            (Direction::Outgoing, None) => false,
        }
    }

    /// Total strong references held toward this object, root refs included.
    pub fn in_degree(&self) -> u64 {
        u64::from(self.root_refs) + self.ref_in.values().map(|&c| u64::from(c)).sum::<u64>()
    }

    /// Total strong references this object holds toward others.
    pub fn out_degree(&self) -> u64 {
        self.ref_out.iter().map(|&(_, c)| u64::from(c)).sum()
    }

    /// Incoming count from one referrer; 0 for unknown referrers.
    pub fn incoming_from(&self, referrer: ObjectId) -> u32 {
        self.ref_in.get(&referrer).copied().unwrap_or(0)
    }

    /// Outgoing count toward one target; 0 for unknown targets.
    pub fn outgoing_to(&self, target: ObjectId) -> u32 {
        self.ref_out
            .iter()
            .find(|(t, _)| *t == target)
            .map_or(0, |&(_, c)| c)
    }

    pub fn root_refs(&self) -> u32 {
        self.root_refs
    }

    /// Distinct targets of outgoing edges, in first-acquisition order.
    pub fn out_targets(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.ref_out.iter().map(|&(t, _)| t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_refs_round_trip() {
        let mut d = Descriptor::new();
        assert_eq!(d.in_degree(), 0);

        d.incr(Direction::Incoming, None);
        d.incr(Direction::Incoming, None);
        assert_eq!(d.root_refs(), 2);
        assert_eq!(d.in_degree(), 2);

        assert!(d.decr(Direction::Incoming, None));
        assert!(d.decr(Direction::Incoming, None));
        assert!(!d.decr(Direction::Incoming, None), "underflow must report");
        assert_eq!(d.in_degree(), 0);
    }

    #[test]
    fn per_referrer_counts() {
        let mut d = Descriptor::new();
        let a = ObjectId(1);
        let b = ObjectId(2);

        d.incr(Direction::Incoming, Some(a));
        d.incr(Direction::Incoming, Some(a));
        d.incr(Direction::Incoming, Some(b));

        assert_eq!(d.incoming_from(a), 2);
        assert_eq!(d.incoming_from(b), 1);
        assert_eq!(d.incoming_from(ObjectId(99)), 0);
        assert_eq!(d.in_degree(), 3);

        assert!(d.decr(Direction::Incoming, Some(a)));
        assert!(d.decr(Direction::Incoming, Some(a)));
        assert_eq!(d.incoming_from(a), 0);
        assert!(
            !d.decr(Direction::Incoming, Some(a)),
            "entry removed at zero, further decrements are unknown"
        );
    }

    #[test]
    fn unknown_referrer_decrement_fails() {
        let mut d = Descriptor::new();
        assert!(!d.decr(Direction::Incoming, Some(ObjectId(7))));
        assert!(!d.decr(Direction::Outgoing, Some(ObjectId(7))));
        assert!(!d.decr(Direction::Incoming, None));
    }

    #[test]
    fn outgoing_preserves_first_acquisition_order() {
        let mut d = Descriptor::new();
        let targets = [ObjectId(5), ObjectId(3), ObjectId(9)];
        for t in targets {
            d.incr(Direction::Outgoing, Some(t));
        }
        // Re-acquiring an existing target must not move it.
        d.incr(Direction::Outgoing, Some(ObjectId(3)));

        let order: Vec<ObjectId> = d.out_targets().collect();
        assert_eq!(order, targets);
        assert_eq!(d.outgoing_to(ObjectId(3)), 2);
        assert_eq!(d.out_degree(), 4);
    }

    #[test]
    fn self_edges_are_tracked_like_any_other() {
        let mut d = Descriptor::new();
        let me = ObjectId(4);

        d.incr(Direction::Incoming, Some(me));
        d.incr(Direction::Outgoing, Some(me));
        assert_eq!(d.incoming_from(me), 1);
        assert_eq!(d.outgoing_to(me), 1);

        assert!(d.decr(Direction::Incoming, Some(me)));
        assert!(d.decr(Direction::Outgoing, Some(me)));
        assert_eq!(d.in_degree(), 0);
        assert_eq!(d.out_degree(), 0);
    }

    #[test]
    fn mixed_roots_and_referrers_aggregate() {
        let mut d = Descriptor::new();
        d.incr(Direction::Incoming, None);
        d.incr(Direction::Incoming, Some(ObjectId(1)));
        d.incr(Direction::Incoming, Some(ObjectId(2)));

        assert_eq!(d.in_degree(), 3);
        assert!(d.decr(Direction::Incoming, Some(ObjectId(1))));
        assert_eq!(d.in_degree(), 2);
        assert!(d.decr(Direction::Incoming, None));
        assert_eq!(d.in_degree(), 1);
    }
}
