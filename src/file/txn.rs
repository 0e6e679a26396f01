use std::fmt;

use crate::error::Result;
use crate::jobs::Tally;
use crate::Error;

/// Which meta operation a transaction performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaKind {
    Unlink,
    UnlinkPart(u32),
    Rename { to: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Names registered as pending, queued reads cancelled, running reads draining.
    Preparing,
    /// Per-part OS operations fanned out to workers, then finalized.
    Committing,
    /// Undoing the parts a failed rename already moved.
    RollingBack,
    Done,
}

/// One unlink or rename of a partitioned file, as an explicit state machine.
#[derive(Debug)]
pub struct MetaTxn {
    kind: MetaKind,
    state: TxnState,
    history: Vec<TxnState>,
    tally: Tally,
}

impl MetaTxn {
    pub fn new(kind: MetaKind) -> Self {
        Self {
            kind,
            state: TxnState::Preparing,
            history: vec![TxnState::Preparing],
            tally: Tally::new(),
        }
    }

    pub fn kind(&self) -> &MetaKind {
        &self.kind
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Every state visited, in order.
    pub fn history(&self) -> &[TxnState] {
        &self.history
    }

    pub fn tally(&self) -> &Tally {
        &self.tally
    }

    pub fn transition(&mut self, next: TxnState) -> Result<()> {
        use TxnState::*;
        let allowed = matches!(
            (self.state, next),
            (Preparing, Committing)
                | (Preparing, Done)
                | (Committing, RollingBack)
                | (Committing, Done)
                | (RollingBack, Done)
        );
        if !allowed {
            return Err(Error::InvalidState(format!(
                "{} cannot move from {:?} to {:?}",
                self.kind, self.state, next
            )));
        }
        tracing::debug!(op = %self.kind, from = ?self.state, to = ?next, "Meta operation state change");
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

impl fmt::Display for MetaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaKind::Unlink => write!(f, "unlink"),
            MetaKind::UnlinkPart(part) => write!(f, "unlink part {}", part),
            MetaKind::Rename { to } => write!(f, "rename to {}", to),
        }
    }
}

/// Which meta operations a file has outstanding.
#[derive(Debug, Default)]
pub struct MetaSlot {
    exclusive: Option<MetaKind>,
    part_unlinks: usize,
}

impl MetaSlot {
    /// Claims the slot for `kind`. A whole-file unlink or rename excludes
    /// everything else; single-part unlinks only exclude the former.
    pub fn begin(&mut self, kind: &MetaKind) -> Result<()> {
        if let Some(current) = &self.exclusive {
            return Err(Error::InvalidOperation(format!(
                "{} requested while {} is outstanding",
                kind, current
            )));
        }
        match kind {
            MetaKind::UnlinkPart(_) => self.part_unlinks += 1,
            _ if self.part_unlinks > 0 => {
                return Err(Error::InvalidOperation(format!(
                    "{} requested while {} part unlinks are outstanding",
                    kind, self.part_unlinks
                )));
            }
            _ => self.exclusive = Some(kind.clone()),
        }
        Ok(())
    }

    pub fn end(&mut self, kind: &MetaKind) {
        match kind {
            MetaKind::UnlinkPart(_) => self.part_unlinks = self.part_unlinks.saturating_sub(1),
            _ => self.exclusive = None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.exclusive.is_some() || self.part_unlinks > 0
    }
}
