//! # Entity Tables
//!
//! The closed set of synchronized tables and their descriptors.
//!
//! ## Dependency Graph
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Entity Dependency Order                             │
//! │                                                                         │
//! │   schema ──► day ──► exercise ─────────────┐                            │
//! │     │         │                            ▼                            │
//! │     └────┬────┘                      exercise_log ──► set_log           │
//! │          ▼                                 ▲                            │
//! │       session ─────────────────────────────┘                            │
//! │                                                                         │
//! │  PUSH:  creates/updates walk the graph left → right                     │
//! │         deletes walk it right → left                                    │
//! │  PULL:  always left → right so parents are bound before children        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every table is described by the same capability set: its storage name,
//! the foreign-key fields in its payload, and its rank in the dependency
//! order. The push and pull pipelines are written once against this
//! descriptor instead of branching per table.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::CoreError;

// =============================================================================
// Entity Table
// =============================================================================

/// A synchronized entity table.
///
/// Variants are declared in dependency order; [`EntityTable::ALL`] and
/// [`EntityTable::rank`] rely on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum EntityTable {
    /// A training program (top of the tree).
    Schema,
    /// A training day inside a schema.
    Day,
    /// A planned exercise inside a day.
    Exercise,
    /// A performed workout session.
    Session,
    /// An exercise performed within a session.
    ExerciseLog,
    /// A single set of an exercise log.
    SetLog,
}

/// A foreign-key field carried in a record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    /// Payload field holding the parent's id.
    pub field: &'static str,
    /// Table the parent lives in.
    pub parent: EntityTable,
    /// Whether a record without this parent is invalid.
    pub required: bool,
}

const fn fk(field: &'static str, parent: EntityTable, required: bool) -> ForeignKey {
    ForeignKey {
        field,
        parent,
        required,
    }
}

const NO_KEYS: &[ForeignKey] = &[];
const DAY_KEYS: &[ForeignKey] = &[fk("schemaId", EntityTable::Schema, true)];
const EXERCISE_KEYS: &[ForeignKey] = &[fk("dayId", EntityTable::Day, true)];
const SESSION_KEYS: &[ForeignKey] = &[
    fk("schemaId", EntityTable::Schema, false),
    fk("dayId", EntityTable::Day, false),
];
const EXERCISE_LOG_KEYS: &[ForeignKey] = &[
    fk("sessionId", EntityTable::Session, true),
    fk("exerciseId", EntityTable::Exercise, false),
];
const SET_LOG_KEYS: &[ForeignKey] = &[fk("exerciseLogId", EntityTable::ExerciseLog, true)];

impl EntityTable {
    /// All tables in dependency order (parents first).
    pub const ALL: [EntityTable; 6] = [
        EntityTable::Schema,
        EntityTable::Day,
        EntityTable::Exercise,
        EntityTable::Session,
        EntityTable::ExerciseLog,
        EntityTable::SetLog,
    ];

    /// Position in the dependency order. Parents always rank lower.
    pub fn rank(self) -> usize {
        self as usize
    }

    /// Stable wire/storage identifier (`exercise_log`).
    pub fn as_str(self) -> &'static str {
        match self {
            EntityTable::Schema => "schema",
            EntityTable::Day => "day",
            EntityTable::Exercise => "exercise",
            EntityTable::Session => "session",
            EntityTable::ExerciseLog => "exercise_log",
            EntityTable::SetLog => "set_log",
        }
    }

    /// Name of the local SQLite table holding rows of this entity.
    pub fn sql_table(self) -> &'static str {
        match self {
            EntityTable::Schema => "schemas",
            EntityTable::Day => "days",
            EntityTable::Exercise => "exercises",
            EntityTable::Session => "sessions",
            EntityTable::ExerciseLog => "exercise_logs",
            EntityTable::SetLog => "set_logs",
        }
    }

    /// Foreign-key fields carried in this table's payloads.
    pub fn foreign_keys(self) -> &'static [ForeignKey] {
        match self {
            EntityTable::Schema => NO_KEYS,
            EntityTable::Day => DAY_KEYS,
            EntityTable::Exercise => EXERCISE_KEYS,
            EntityTable::Session => SESSION_KEYS,
            EntityTable::ExerciseLog => EXERCISE_LOG_KEYS,
            EntityTable::SetLog => SET_LOG_KEYS,
        }
    }

    /// Returns true if `self` depends on `other`, directly or transitively.
    pub fn depends_on(self, other: EntityTable) -> bool {
        self.foreign_keys()
            .iter()
            .any(|key| key.parent == other || key.parent.depends_on(other))
    }

    /// Returns true if a blocked `chain_root` must also hold back `self`.
    ///
    /// A table is in the chain of itself and of every table it depends on.
    pub fn in_chain_of(self, chain_root: EntityTable) -> bool {
        self == chain_root || self.depends_on(chain_root)
    }
}

impl std::fmt::Display for EntityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityTable {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityTable::ALL
            .into_iter()
            .find(|table| table.as_str() == s || table.sql_table() == s)
            .ok_or_else(|| CoreError::UnknownTable(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_is_in_dependency_order() {
        for table in EntityTable::ALL {
            for key in table.foreign_keys() {
                assert!(
                    key.parent.rank() < table.rank(),
                    "{} must rank after its parent {}",
                    table,
                    key.parent
                );
            }
        }
    }

    #[test]
    fn test_transitive_dependencies() {
        assert!(EntityTable::SetLog.depends_on(EntityTable::Schema));
        assert!(EntityTable::Exercise.depends_on(EntityTable::Schema));
        assert!(!EntityTable::Session.depends_on(EntityTable::Exercise));
        assert!(!EntityTable::Schema.depends_on(EntityTable::Day));
    }

    #[test]
    fn test_chain_membership() {
        assert!(EntityTable::Day.in_chain_of(EntityTable::Day));
        assert!(EntityTable::ExerciseLog.in_chain_of(EntityTable::Day));
        assert!(!EntityTable::Schema.in_chain_of(EntityTable::Day));
    }

    #[test]
    fn test_parse_accepts_both_names() {
        assert_eq!("exercise_log".parse::<EntityTable>().unwrap(), EntityTable::ExerciseLog);
        assert_eq!("set_logs".parse::<EntityTable>().unwrap(), EntityTable::SetLog);
        assert!("workouts".parse::<EntityTable>().is_err());
    }
}
