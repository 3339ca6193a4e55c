//! Card-presence transition detection

use pcsc::State;

/// Outcome of comparing two reader-state snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardChange {
    /// No presence transition between the snapshots.
    None,
    /// A card appeared.
    Inserted,
    /// A card disappeared.
    Removed,
}

/// Classify the card-presence transition between two reader states.
///
/// Only `State::PRESENT` is consulted; every other flag is ignored. This is
/// the single presence predicate: all monitor paths (live changes, periodic
/// refresh, timeout reconciliation) route through it.
pub fn detect(old: State, new: State) -> CardChange {
    let was_present = old.contains(State::PRESENT);
    let is_present = new.contains(State::PRESENT);
    match (was_present, is_present) {
        (false, true) => CardChange::Inserted,
        (true, false) => CardChange::Removed,
        _ => CardChange::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits(raw: u32) -> State {
        State::from_bits_truncate(raw.into())
    }

    #[test]
    fn insertion_and_removal() {
        assert_eq!(detect(bits(0x00), bits(0x20)), CardChange::Inserted);
        assert_eq!(detect(bits(0x20), bits(0x00)), CardChange::Removed);
        assert_eq!(detect(bits(0x20), bits(0x20)), CardChange::None);
    }

    #[test]
    fn other_flags_are_ignored() {
        // INUSE | CHANGED gaining PRESENT is still an insertion.
        assert_eq!(detect(bits(0x0102), bits(0x0122)), CardChange::Inserted);
        assert_eq!(detect(bits(0x0122), bits(0x0102)), CardChange::Removed);
    }

    #[test]
    fn identical_states_never_report_a_change() {
        for raw in [0x0000u32, 0x0010, 0x0020, 0x0122, 0x03FF] {
            assert_eq!(detect(bits(raw), bits(raw)), CardChange::None);
        }
    }
}
