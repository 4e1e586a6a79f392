use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{BranchError, Result};

struct Snapshot {
    id: u64,
    name: String,
    previous: Option<String>,
    /// Thread that opened the outermost scope of this variable
    owner: ThreadId,
}

static SCOPES: Mutex<Vec<Snapshot>> = parking_lot::const_mutex(Vec::new());
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Sets a process environment variable for the lifetime of the scope.
///
/// Scopes of one variable nest and must unwind in LIFO order. Dropping a
/// scope restores the value seen when it was activated, so a panicking test
/// still leaves the environment as it found it.
///
/// The thread that opens the outermost scope owns the variable; `activate`
/// from any other thread fails with `EnvConflict`. Async code that may resume
/// on another worker thread nests through [`EnvScope::nest`], which inherits
/// ownership from the enclosing scope.
#[derive(Debug)]
pub struct EnvScope {
    id: u64,
    name: String,
    value: String,
    owner: ThreadId,
    active: bool,
}

impl EnvScope {
    pub fn activate(name: &str, value: &str) -> Result<Self> {
        let mut scopes = SCOPES.lock();
        let current = thread::current().id();

        if scopes.iter().any(|s| s.name == name && s.owner != current) {
            return Err(BranchError::EnvConflict {
                name: name.to_string(),
            });
        }
        Ok(push(&mut scopes, name, value, current))
    }

    /// Open an inner scope of the same variable, owned like this one
    pub fn nest(&self, value: &str) -> Result<Self> {
        let mut scopes = SCOPES.lock();
        if !self.active || !scopes.iter().any(|s| s.id == self.id) {
            return Err(BranchError::ScopeOrder {
                name: self.name.clone(),
                depth: depth(&scopes, &self.name),
                position: 0,
            });
        }
        Ok(push(&mut scopes, &self.name, value, self.owner))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Restore the value recorded at activation. Fails with `ScopeOrder`,
    /// leaving everything untouched, when an inner scope of the same variable
    /// is still active.
    pub fn deactivate(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }

        let mut scopes = SCOPES.lock();
        let ours: Vec<usize> = positions(&scopes, &self.name);
        let Some(position) = ours.iter().position(|&i| scopes[i].id == self.id) else {
            self.active = false;
            return Ok(());
        };

        if position + 1 != ours.len() {
            return Err(BranchError::ScopeOrder {
                name: self.name.clone(),
                depth: ours.len(),
                position: position + 1,
            });
        }

        let snapshot = scopes.remove(ours[position]);
        restore(&snapshot.name, snapshot.previous.as_deref());
        self.active = false;
        debug!("Restored {} (depth {})", self.name, position);
        Ok(())
    }
}

impl Drop for EnvScope {
    fn drop(&mut self) {
        match self.deactivate() {
            Ok(()) => {}
            Err(e) => {
                warn!("{}", e);
                // Splice the scope out: the scope above inherits our recorded
                // value, so unwinding the rest still ends at the original.
                let mut scopes = SCOPES.lock();
                let ours = positions(&scopes, &self.name);
                if let Some(position) = ours.iter().position(|&i| scopes[i].id == self.id) {
                    let snapshot = scopes.remove(ours[position]);
                    let above = ours[position + 1] - 1;
                    scopes[above].previous = snapshot.previous;
                }
                self.active = false;
            }
        }
    }
}

fn push(scopes: &mut Vec<Snapshot>, name: &str, value: &str, owner: ThreadId) -> EnvScope {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    scopes.push(Snapshot {
        id,
        name: name.to_string(),
        previous: env::var(name).ok(),
        owner,
    });
    env::set_var(name, value);
    debug!("Scoped {} (depth {})", name, depth(scopes, name));

    EnvScope {
        id,
        name: name.to_string(),
        value: value.to_string(),
        owner,
        active: true,
    }
}

fn positions(scopes: &[Snapshot], name: &str) -> Vec<usize> {
    scopes
        .iter()
        .enumerate()
        .filter(|(_, s)| s.name == name)
        .map(|(i, _)| i)
        .collect()
}

fn depth(scopes: &[Snapshot], name: &str) -> usize {
    scopes.iter().filter(|s| s.name == name).count()
}

fn restore(name: &str, previous: Option<&str>) {
    match previous {
        Some(value) => env::set_var(name, value),
        None => env::remove_var(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_scopes_restore_in_order() {
        let name = "NEON_SCOPE_TEST_NESTED";
        env::set_var(name, "original");

        let mut outer = EnvScope::activate(name, "outer").unwrap();
        assert_eq!(env::var(name).unwrap(), "outer");
        {
            let _inner = EnvScope::activate(name, "inner").unwrap();
            assert_eq!(env::var(name).unwrap(), "inner");
            env::set_var(name, "mutated");
        }
        assert_eq!(env::var(name).unwrap(), "outer");

        outer.deactivate().unwrap();
        assert!(!outer.is_active());
        assert_eq!(env::var(name).unwrap(), "original");
        env::remove_var(name);
    }

    #[test]
    fn test_absent_variable_is_removed_again() {
        let name = "NEON_SCOPE_TEST_ABSENT";
        env::remove_var(name);

        let scope = EnvScope::activate(name, "postgresql://branch").unwrap();
        assert_eq!(env::var(name).unwrap(), "postgresql://branch");
        // Someone else clobbers it; the recorded state still wins
        env::set_var(name, "clobbered");
        drop(scope);

        assert!(env::var(name).is_err());
    }

    #[test]
    fn test_out_of_order_deactivation() {
        let name = "NEON_SCOPE_TEST_ORDER";
        env::remove_var(name);

        let mut outer = EnvScope::activate(name, "outer").unwrap();
        let inner = EnvScope::activate(name, "inner").unwrap();

        let err = outer.deactivate().unwrap_err();
        assert!(matches!(err, BranchError::ScopeOrder { depth: 2, position: 1, .. }));
        assert_eq!(env::var(name).unwrap(), "inner");

        // Dropping out of order still unwinds to the original state
        drop(outer);
        assert_eq!(env::var(name).unwrap(), "inner");
        drop(inner);
        assert!(env::var(name).is_err());
    }

    #[test]
    fn test_other_thread_conflicts() {
        let name = "NEON_SCOPE_TEST_THREADS";
        let _scope = EnvScope::activate(name, "main").unwrap();

        let result = thread::spawn(move || EnvScope::activate(name, "worker").map(|_| ()))
            .join()
            .unwrap();
        assert!(matches!(result, Err(BranchError::EnvConflict { .. })));
        assert_eq!(env::var(name).unwrap(), "main");
    }

    #[test]
    fn test_nest_from_another_thread() {
        let name = "NEON_SCOPE_TEST_NEST";
        env::remove_var(name);
        let outer = EnvScope::activate(name, "outer").unwrap();

        // A task resumed on another worker thread nests through its handle
        let outer = thread::spawn(move || {
            let inner = outer.nest("inner").unwrap();
            assert_eq!(env::var(name).unwrap(), "inner");
            drop(inner);
            outer
        })
        .join()
        .unwrap();
        assert_eq!(env::var(name).unwrap(), "outer");

        // Ownership stays with the thread that opened the outer scope
        let nested = EnvScope::activate(name, "same-thread").unwrap();
        drop(nested);
        drop(outer);
        assert!(env::var(name).is_err());
    }

    #[test]
    fn test_nest_requires_active_scope() {
        let name = "NEON_SCOPE_TEST_NEST_INACTIVE";
        let mut scope = EnvScope::activate(name, "value").unwrap();
        scope.deactivate().unwrap();

        assert!(matches!(scope.nest("late"), Err(BranchError::ScopeOrder { .. })));
        assert!(env::var(name).is_err());
    }
}
