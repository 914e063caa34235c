//! State-schema migration path (§4.B).

use crate::model::WorkflowState;
use quorum_core::{CoreError, ErrorCode};

/// Bump whenever `WorkflowState`'s on-disk shape changes in a
/// non-backward-compatible way and register a `Migration` below.
pub const CURRENT_STATE_VERSION: u32 = 1;

pub trait Migration: Send + Sync {
    /// The version this migration upgrades *from*.
    fn from_version(&self) -> u32;
    fn migrate(&self, state: &mut WorkflowState);
}

/// Applies registered migrations in order until `state.version` reaches
/// `CURRENT_STATE_VERSION`. Unknown higher versions are a hard error —
/// we refuse to guess how to downgrade.
pub fn apply_migrations(state: &mut WorkflowState, migrations: &[Box<dyn Migration>]) -> Result<(), CoreError> {
    if state.version > CURRENT_STATE_VERSION {
        return Err(CoreError::new(
            ErrorCode::StateMigration,
            format!(
                "state version {} is newer than this binary supports ({})",
                state.version, CURRENT_STATE_VERSION
            ),
        ));
    }
    while state.version < CURRENT_STATE_VERSION {
        let applicable = migrations.iter().find(|m| m.from_version() == state.version);
        match applicable {
            Some(migration) => {
                migration.migrate(state);
                state.version += 1;
            }
            None => {
                return Err(CoreError::new(
                    ErrorCode::StateMigration,
                    format!("no migration registered from version {}", state.version),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Blueprint, WorkflowId};

    #[test]
    fn no_migrations_needed_when_current() {
        let mut state = WorkflowState::new(WorkflowId::generate(0), "test", Blueprint::default());
        assert_eq!(state.version, CURRENT_STATE_VERSION);
        apply_migrations(&mut state, &[]).unwrap();
        assert_eq!(state.version, CURRENT_STATE_VERSION);
    }

    #[test]
    fn future_version_is_rejected() {
        let mut state = WorkflowState::new(WorkflowId::generate(0), "test", Blueprint::default());
        state.version = CURRENT_STATE_VERSION + 1;
        let err = apply_migrations(&mut state, &[]).unwrap_err();
        assert_eq!(err.code, ErrorCode::StateMigration);
    }
}
