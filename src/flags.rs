//! The flag word (§6): sync-mode bits, addressing mode, aggregation and in-segment hints.

use bitflags::bitflags;

use crate::error::{fatal, FatalError};

bitflags! {
    /// Flags accompanying a collective request.
    ///
    /// Exactly one of `IN_NOSYNC`/`IN_MYSYNC`/`IN_ALLSYNC` and exactly one of
    /// `OUT_NOSYNC`/`OUT_MYSYNC`/`OUT_ALLSYNC` and exactly one of `SINGLE`/`LOCAL` must be set;
    /// [`CollFlags::validate`] enforces this and is called by the dispatch layer before anything
    /// else happens.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct CollFlags: u32 {
        const IN_NOSYNC        = 1 << 0;
        const IN_MYSYNC        = 1 << 1;
        const IN_ALLSYNC       = 1 << 2;
        const OUT_NOSYNC       = 1 << 3;
        const OUT_MYSYNC       = 1 << 4;
        const OUT_ALLSYNC      = 1 << 5;
        const SINGLE           = 1 << 6;
        const LOCAL            = 1 << 7;
        const AGGREGATE        = 1 << 8;
        const DST_IN_SEGMENT   = 1 << 9;
        const SRC_IN_SEGMENT   = 1 << 10;
    }
}

const IN_MASK: CollFlags = CollFlags::IN_NOSYNC
    .union(CollFlags::IN_MYSYNC)
    .union(CollFlags::IN_ALLSYNC);
const OUT_MASK: CollFlags = CollFlags::OUT_NOSYNC
    .union(CollFlags::OUT_MYSYNC)
    .union(CollFlags::OUT_ALLSYNC);
const ADDR_MASK: CollFlags = CollFlags::SINGLE.union(CollFlags::LOCAL);

impl CollFlags {
    /// Validate the exactly-one-of-each-group invariant described in §6. Fatal on violation,
    /// matching step 2 of the dispatch pipeline (§4.8).
    pub fn validate(self) {
        if (self & IN_MASK).bits().count_ones() != 1 {
            fatal(FatalError::BadFlags(
                "exactly one of IN_NOSYNC/IN_MYSYNC/IN_ALLSYNC must be set".into(),
            ));
        }
        if (self & OUT_MASK).bits().count_ones() != 1 {
            fatal(FatalError::BadFlags(
                "exactly one of OUT_NOSYNC/OUT_MYSYNC/OUT_ALLSYNC must be set".into(),
            ));
        }
        if (self & ADDR_MASK).bits().count_ones() != 1 {
            fatal(FatalError::BadFlags(
                "exactly one of SINGLE/LOCAL must be set".into(),
            ));
        }
    }

    pub fn needs_in_barrier(self) -> bool {
        self.contains(CollFlags::IN_ALLSYNC)
    }

    pub fn needs_out_barrier(self) -> bool {
        self.contains(CollFlags::OUT_ALLSYNC)
    }

    pub fn is_aggregate(self) -> bool {
        self.contains(CollFlags::AGGREGATE)
    }

    pub fn is_single(self) -> bool {
        self.contains(CollFlags::SINGLE)
    }

    pub fn dst_in_segment(self) -> bool {
        self.contains(CollFlags::DST_IN_SEGMENT)
    }

    pub fn src_in_segment(self) -> bool {
        self.contains(CollFlags::SRC_IN_SEGMENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_combo_passes() {
        let f = CollFlags::IN_NOSYNC | CollFlags::OUT_ALLSYNC | CollFlags::SINGLE;
        f.validate();
    }

    #[test]
    #[should_panic]
    fn missing_in_sync_is_fatal() {
        let f = CollFlags::OUT_ALLSYNC | CollFlags::SINGLE;
        f.validate();
    }

    #[test]
    #[should_panic]
    fn both_single_and_local_is_fatal() {
        let f = CollFlags::IN_NOSYNC | CollFlags::OUT_NOSYNC | CollFlags::SINGLE | CollFlags::LOCAL;
        f.validate();
    }
}
