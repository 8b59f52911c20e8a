//! Memory lifecycle states and the transitions allowed between them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryState {
    /// Visible to search.
    Active,
    /// Hidden from default queries; reversible.
    Paused,
    /// Hidden; returns to active only by explicit unarchive.
    Archived,
    /// Terminal.
    Deleted,
}

impl MemoryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        }
    }

    /// Whether `self -> to` is a legal move. Staying put is always legal.
    pub fn can_transition_to(self, to: MemoryState) -> bool {
        use MemoryState::*;
        if self == to {
            return true;
        }
        match (self, to) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Active, Paused) | (Paused, Active) => true,
            (Active, Archived) | (Paused, Archived) => true,
            (Archived, Active) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for MemoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "archived" => Ok(Self::Archived),
            "deleted" => Ok(Self::Deleted),
            _ => Err(format!("unknown memory state: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryState::*;
    use super::*;

    #[test]
    fn transition_table() {
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Paused.can_transition_to(Archived));
        assert!(Archived.can_transition_to(Active));
        assert!(!Archived.can_transition_to(Paused));
        assert!(Archived.can_transition_to(Deleted));
        assert!(!Deleted.can_transition_to(Active));
        assert!(Deleted.can_transition_to(Deleted));
    }

    #[test]
    fn parse_roundtrip() {
        for state in [Active, Paused, Archived, Deleted] {
            assert_eq!(state.as_str().parse::<MemoryState>().unwrap(), state);
        }
        assert!("gone".parse::<MemoryState>().is_err());
    }
}
