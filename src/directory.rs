use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::{Actor, Role, Scope};

/// Actor lookup collaborator. Identities arrive already authenticated;
/// the engine only needs role and organizational scope.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn lookup(&self, id: &Ulid) -> Option<Actor>;

    /// Would `register(actor)` succeed right now? Stores nothing.
    fn admit(&self, actor: &Actor) -> Result<(), DirectoryError>;

    fn register(&self, actor: Actor) -> Result<(), DirectoryError>;

    fn deactivate(&self, id: &Ulid) -> Result<(), DirectoryError>;
}

#[derive(Debug)]
pub enum DirectoryError {
    DuplicateRepresentative(Scope),
    DuplicateStaff(Scope),
    Invalid(&'static str),
    NotFound(Ulid),
    Roster(String),
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::DuplicateRepresentative(scope) => {
                write!(f, "{scope} already has an active representative")
            }
            DirectoryError::DuplicateStaff(scope) => {
                write!(f, "{scope} already has an active staff advisor")
            }
            DirectoryError::Invalid(msg) => write!(f, "invalid actor: {msg}"),
            DirectoryError::NotFound(id) => write!(f, "actor not found: {id}"),
            DirectoryError::Roster(e) => write!(f, "roster error: {e}"),
        }
    }
}

impl std::error::Error for DirectoryError {}

/// In-memory actor roster.
///
/// Enforces at most one active representative and at most one active staff
/// advisor per (department, cohort).
pub struct InMemoryDirectory {
    actors: DashMap<Ulid, Actor>,
    /// Serializes registrations so the uniqueness scan and the insert are atomic.
    write_gate: Mutex<()>,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            actors: DashMap::new(),
            write_gate: Mutex::new(()),
        }
    }

    /// Load a JSON array of actors. Invariant violations abort the load.
    pub fn load_roster(path: &Path) -> Result<Self, DirectoryError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DirectoryError::Roster(format!("{}: {e}", path.display())))?;
        let actors: Vec<Actor> =
            serde_json::from_str(&raw).map_err(|e| DirectoryError::Roster(e.to_string()))?;
        let dir = Self::new();
        for actor in actors {
            dir.register(actor)?;
        }
        info!("loaded {} actors from {}", dir.len(), path.display());
        Ok(dir)
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Option<Actor> {
        self.actors.get(id).map(|e| e.value().clone())
    }

    /// Insert or replace an actor.
    pub fn register(&self, actor: Actor) -> Result<(), DirectoryError> {
        let _gate = self.write_gate.lock().unwrap_or_else(|p| p.into_inner());
        self.check(&actor)?;
        self.actors.insert(actor.id, actor);
        Ok(())
    }

    /// Field limits, plus uniqueness of an active representative or staff
    /// advisor within its scope. Caller holds the write gate.
    fn check(&self, actor: &Actor) -> Result<(), DirectoryError> {
        if actor.scope.department.trim().is_empty() {
            return Err(DirectoryError::Invalid("department code is empty"));
        }
        if actor.scope.department.len() > MAX_DEPARTMENT_LEN {
            return Err(DirectoryError::Invalid("department code too long"));
        }
        if let Some(ref n) = actor.name
            && n.len() > MAX_NAME_LEN {
                return Err(DirectoryError::Invalid("name too long"));
            }
        let role = actor.effective_role();
        if matches!(role, Role::Representative | Role::Staff) && actor.scope.cohort.is_none() {
            return Err(DirectoryError::Invalid("representatives and staff need a cohort"));
        }

        if actor.active && matches!(role, Role::Representative | Role::Staff) {
            let clash = self.actors.iter().any(|e| {
                let other = e.value();
                other.id != actor.id
                    && other.active
                    && other.effective_role() == role
                    && other.scope == actor.scope
            });
            if clash {
                return Err(match role {
                    Role::Representative => {
                        DirectoryError::DuplicateRepresentative(actor.scope.clone())
                    }
                    _ => DirectoryError::DuplicateStaff(actor.scope.clone()),
                });
            }
        }
        Ok(())
    }

    /// Soft delete: the actor stays resolvable but can no longer act.
    pub fn deactivate(&self, id: &Ulid) -> Result<(), DirectoryError> {
        let _gate = self.write_gate.lock().unwrap_or_else(|p| p.into_inner());
        let mut entry = self.actors.get_mut(id).ok_or(DirectoryError::NotFound(*id))?;
        entry.active = false;
        Ok(())
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn lookup(&self, id: &Ulid) -> Option<Actor> {
        self.get(id)
    }

    fn admit(&self, actor: &Actor) -> Result<(), DirectoryError> {
        let _gate = self.write_gate.lock().unwrap_or_else(|p| p.into_inner());
        self.check(actor)
    }

    fn register(&self, actor: Actor) -> Result<(), DirectoryError> {
        InMemoryDirectory::register(self, actor)
    }

    fn deactivate(&self, id: &Ulid) -> Result<(), DirectoryError> {
        InMemoryDirectory::deactivate(self, id)
    }
}
