//! Runtime ownership ledger.
//!
//! Every binding carries a [`LedgerEntry`] tracking whether its value is
//! owned, moved away, or lent out. Transitions are checked here; the
//! environment turns violations into `OwnershipError` diagnostics.

use std::fmt;

pub type BorrowId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OwnershipState {
    #[default]
    Owned,
    Moved,
    SharedBorrow(usize),
    ExclusiveBorrow,
}

impl fmt::Display for OwnershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnershipState::Owned => write!(f, "owned"),
            OwnershipState::Moved => write!(f, "moved"),
            OwnershipState::SharedBorrow(count) => write!(f, "shared-borrowed ({count})"),
            OwnershipState::ExclusiveBorrow => write!(f, "exclusively borrowed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorrowKind {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    UseAfterMove,
    MoveWhileBorrowed(OwnershipState),
    WriteWhileBorrowed(OwnershipState),
    SharedWhileExclusive,
    ExclusiveWhileBorrowed(OwnershipState),
    NoOpenBorrow,
    HandleReleased,
}

impl Violation {
    /// Full message for a violation on the binding called `name`.
    pub fn message(self, name: &str) -> String {
        match self {
            Violation::UseAfterMove => format!("use of moved value `{name}`"),
            Violation::MoveWhileBorrowed(state) => {
                format!("cannot move `{name}` while it is {state}")
            }
            Violation::WriteWhileBorrowed(state) => {
                format!("cannot assign to `{name}` while it is {state}")
            }
            Violation::SharedWhileExclusive => {
                format!("cannot borrow `{name}` while it is exclusively borrowed")
            }
            Violation::ExclusiveWhileBorrowed(state) => {
                format!("cannot borrow `{name}` exclusively while it is {state}")
            }
            Violation::NoOpenBorrow => format!("`{name}` has no open borrow to release"),
            Violation::HandleReleased => format!("borrow of `{name}` has already been released"),
        }
    }
}

/// Ownership bookkeeping for a single binding.
#[derive(Debug, Clone, Default)]
pub struct LedgerEntry {
    state: OwnershipState,
    open: Vec<(BorrowId, BorrowKind)>,
}

impl LedgerEntry {
    pub fn state(&self) -> OwnershipState {
        self.state
    }

    pub fn is_open(&self, id: BorrowId) -> bool {
        self.open.iter().any(|(open, _)| *open == id)
    }

    pub fn check_read(&self) -> Result<(), Violation> {
        match self.state {
            OwnershipState::Moved => Err(Violation::UseAfterMove),
            _ => Ok(()),
        }
    }

    /// Plain writes need an owned binding; a write through an exclusive
    /// handle needs that handle to still be open.
    pub fn check_write(&self, via: Option<BorrowId>) -> Result<(), Violation> {
        match (self.state, via) {
            (OwnershipState::Owned, None) => Ok(()),
            (OwnershipState::Moved, _) => Err(Violation::UseAfterMove),
            (OwnershipState::ExclusiveBorrow, Some(id)) if self.is_open(id) => Ok(()),
            (_, Some(id)) if !self.is_open(id) => Err(Violation::HandleReleased),
            (state, _) => Err(Violation::WriteWhileBorrowed(state)),
        }
    }

    pub fn check_move(&self) -> Result<(), Violation> {
        match self.state {
            OwnershipState::Owned => Ok(()),
            OwnershipState::Moved => Err(Violation::UseAfterMove),
            state => Err(Violation::MoveWhileBorrowed(state)),
        }
    }

    /// A move may land on a binding that is owned or already moved away, but
    /// never on one that is lent out.
    pub fn check_replace(&self) -> Result<(), Violation> {
        match self.state {
            OwnershipState::Owned | OwnershipState::Moved => Ok(()),
            state => Err(Violation::WriteWhileBorrowed(state)),
        }
    }

    pub fn mark_moved(&mut self) -> Result<(), Violation> {
        self.check_move()?;
        self.state = OwnershipState::Moved;
        Ok(())
    }

    pub fn borrow_shared(&mut self, id: BorrowId) -> Result<(), Violation> {
        self.state = match self.state {
            OwnershipState::Owned => OwnershipState::SharedBorrow(1),
            OwnershipState::SharedBorrow(count) => OwnershipState::SharedBorrow(count + 1),
            OwnershipState::Moved => return Err(Violation::UseAfterMove),
            OwnershipState::ExclusiveBorrow => return Err(Violation::SharedWhileExclusive),
        };
        self.open.push((id, BorrowKind::Shared));
        Ok(())
    }

    pub fn borrow_exclusive(&mut self, id: BorrowId) -> Result<(), Violation> {
        match self.state {
            OwnershipState::Owned => {}
            OwnershipState::Moved => return Err(Violation::UseAfterMove),
            state => return Err(Violation::ExclusiveWhileBorrowed(state)),
        }
        self.state = OwnershipState::ExclusiveBorrow;
        self.open.push((id, BorrowKind::Exclusive));
        Ok(())
    }

    /// Closes the borrow `id`, or the most recent open borrow when `id` is
    /// `None`.
    pub fn release(&mut self, id: Option<BorrowId>) -> Result<BorrowKind, Violation> {
        let position = match id {
            Some(id) => self
                .open
                .iter()
                .position(|(open, _)| *open == id)
                .ok_or(Violation::HandleReleased)?,
            None => self
                .open
                .len()
                .checked_sub(1)
                .ok_or(Violation::NoOpenBorrow)?,
        };
        let (_, kind) = self.open.remove(position);
        self.state = match (kind, self.state) {
            (BorrowKind::Shared, OwnershipState::SharedBorrow(count)) if count > 1 => {
                OwnershipState::SharedBorrow(count - 1)
            }
            _ => OwnershipState::Owned,
        };
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn shared_borrows_stack_and_unwind() {
        let mut entry = LedgerEntry::default();
        entry.borrow_shared(1).unwrap();
        entry.borrow_shared(2).unwrap();
        assert_eq!(entry.state(), OwnershipState::SharedBorrow(2));
        assert!(entry.check_read().is_ok());

        assert_eq!(entry.release(None), Ok(BorrowKind::Shared));
        assert_eq!(entry.state(), OwnershipState::SharedBorrow(1));
        assert_eq!(entry.release(Some(1)), Ok(BorrowKind::Shared));
        assert_eq!(entry.state(), OwnershipState::Owned);
        assert_eq!(entry.release(None), Err(Violation::NoOpenBorrow));
    }

    #[test]
    fn exclusive_borrow_requires_owned() {
        let mut entry = LedgerEntry::default();
        entry.borrow_shared(1).unwrap();
        assert_eq!(
            entry.borrow_exclusive(2),
            Err(Violation::ExclusiveWhileBorrowed(OwnershipState::SharedBorrow(1)))
        );
        entry.release(None).unwrap();
        entry.borrow_exclusive(3).unwrap();
        assert_eq!(entry.borrow_shared(4), Err(Violation::SharedWhileExclusive));
    }

    #[test]
    fn moved_binding_rejects_everything() {
        let mut entry = LedgerEntry::default();
        entry.mark_moved().unwrap();
        assert_eq!(entry.check_read(), Err(Violation::UseAfterMove));
        assert_eq!(entry.check_write(None), Err(Violation::UseAfterMove));
        assert_eq!(entry.mark_moved(), Err(Violation::UseAfterMove));
        assert_eq!(entry.borrow_shared(1), Err(Violation::UseAfterMove));
    }

    #[test]
    fn cannot_move_while_borrowed() {
        let mut entry = LedgerEntry::default();
        entry.borrow_shared(1).unwrap();
        assert_eq!(
            entry.mark_moved(),
            Err(Violation::MoveWhileBorrowed(OwnershipState::SharedBorrow(1)))
        );
    }

    #[test]
    fn writes_go_through_the_open_exclusive_handle() {
        let mut entry = LedgerEntry::default();
        entry.borrow_exclusive(7).unwrap();
        assert!(entry.check_write(Some(7)).is_ok());
        assert_eq!(
            entry.check_write(None),
            Err(Violation::WriteWhileBorrowed(OwnershipState::ExclusiveBorrow))
        );
        entry.release(Some(7)).unwrap();
        assert_eq!(entry.check_write(Some(7)), Err(Violation::HandleReleased));
        assert!(entry.check_write(None).is_ok());
    }

    #[test]
    fn violation_messages_name_the_binding() {
        assert_eq!(
            Violation::UseAfterMove.message("data"),
            "use of moved value `data`"
        );
    }
}
