//! Role-based access control: the user/role catalog and cached
//! per-connection privilege contexts.
//!
//! A [`PrivilegeContext`] is a cached authorization decision vector for a
//! `(user, bucket)` pair, stamped with the catalog generation it was built
//! from. Reloading the catalog bumps the generation; existing contexts then
//! answer [`PrivilegeAccess::Stale`] and must be rebuilt before reuse —
//! `Stale` is a tri-state, not an error.

use std::sync::atomic::{AtomicU64, Ordering};

use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::protocol::Opcode;

/// Authentication domain a user belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    #[default]
    Local,
    External,
}

/// A privilege a command may require.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Privilege {
    Read,
    Upsert,
    Remove,
    Stats,
}

impl Privilege {
    /// Every bucket-scoped privilege, granted wholesale to connections on
    /// bucket 0 ("no bucket").
    pub const ALL_BUCKET: [Privilege; 4] = [
        Privilege::Read,
        Privilege::Upsert,
        Privilege::Remove,
        Privilege::Stats,
    ];
}

/// The privilege an opcode requires before dispatch, if any.
#[must_use]
pub fn required_privilege(opcode: Opcode) -> Option<Privilege> {
    match opcode {
        Opcode::Get => Some(Privilege::Read),
        Opcode::Set | Opcode::Add | Opcode::Replace => Some(Privilege::Upsert),
        Opcode::Delete => Some(Privilege::Remove),
        Opcode::Quit
        | Opcode::Noop
        | Opcode::Version
        | Opcode::Hello
        | Opcode::SaslListMechs
        | Opcode::SaslAuth
        | Opcode::SaslStep
        | Opcode::SelectBucket => None,
    }
}

/// Tri-state answer from a privilege check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrivilegeAccess {
    Ok,
    Fail,
    /// The catalog changed since this context was built; rebuild and
    /// re-check.
    Stale,
}

/// Errors from catalog lookups and reloads.
#[derive(Debug, Error, Diagnostic)]
pub enum RbacError {
    #[error("no such user: {user}")]
    #[diagnostic(code(tidemark::rbac::no_such_user))]
    NoSuchUser { user: String },

    #[error("user {user} has no access to bucket {bucket}")]
    #[diagnostic(code(tidemark::rbac::no_such_bucket))]
    NoSuchBucket { user: String, bucket: String },

    #[error("malformed user database: {0}")]
    #[diagnostic(
        code(tidemark::rbac::malformed),
        help("The user database is a JSON document: {{\"users\": {{<name>: {{...}}}}}}.")
    )]
    Malformed(#[from] serde_json::Error),
}

/// One user record in the catalog.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UserEntry {
    #[serde(default)]
    pub domain: Domain,
    #[serde(default)]
    pub internal: bool,
    /// Bucket name (or `"*"` wildcard) to granted privileges.
    #[serde(default)]
    pub buckets: FxHashMap<String, Vec<Privilege>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    users: FxHashMap<String, UserEntry>,
}

/// The global user/role catalog.
///
/// Read-mostly; reloads swap the whole table and bump the generation so
/// cached [`PrivilegeContext`]s know to rebuild.
#[derive(Debug, Default)]
pub struct RbacDatabase {
    users: RwLock<FxHashMap<String, UserEntry>>,
    generation: AtomicU64,
}

impl RbacDatabase {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a catalog from its JSON document.
    pub fn from_json(json: &str) -> Result<Self, RbacError> {
        let db = Self::new();
        db.reload_json(json)?;
        Ok(db)
    }

    /// Replace the catalog contents and invalidate every cached context.
    pub fn reload_json(&self, json: &str) -> Result<(), RbacError> {
        let parsed: CatalogFile = serde_json::from_str(json)?;
        *self.users.write() = parsed.users;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!(generation, "reloaded user catalog");
        Ok(())
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Look up a user record.
    pub fn lookup(&self, user: &str) -> Result<UserEntry, RbacError> {
        self.users
            .read()
            .get(user)
            .cloned()
            .ok_or_else(|| RbacError::NoSuchUser {
                user: user.to_string(),
            })
    }

    /// Build a privilege context for `(user, bucket)`.
    ///
    /// An empty bucket name yields a context with no bucket privileges —
    /// the shape used after a bucket disappears beneath a connection.
    pub fn create_context(&self, user: &str, bucket: &str) -> Result<PrivilegeContext, RbacError> {
        let entry = self.lookup(user)?;
        let mut privileges = FxHashSet::default();
        if !bucket.is_empty() {
            let grants = entry
                .buckets
                .get(bucket)
                .or_else(|| entry.buckets.get("*"))
                .ok_or_else(|| RbacError::NoSuchBucket {
                    user: user.to_string(),
                    bucket: bucket.to_string(),
                })?;
            privileges.extend(grants.iter().copied());
        }
        Ok(PrivilegeContext {
            generation: self.generation(),
            bucket: bucket.to_string(),
            privileges,
            internal: entry.internal,
        })
    }
}

/// Cached authorization decisions for one `(user, bucket)` pair.
#[derive(Clone, Debug, Default)]
pub struct PrivilegeContext {
    generation: u64,
    bucket: String,
    privileges: FxHashSet<Privilege>,
    internal: bool,
}

impl PrivilegeContext {
    /// An empty context granting nothing; used before authentication and
    /// when a rebuild fails.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Check a privilege against this context.
    ///
    /// `current_generation` is the catalog's live generation; a mismatch
    /// means the catalog was reloaded after this context was built.
    #[must_use]
    pub fn check(&self, privilege: Privilege, current_generation: u64) -> PrivilegeAccess {
        if self.generation != current_generation {
            return PrivilegeAccess::Stale;
        }
        if self.privileges.contains(&privilege) {
            PrivilegeAccess::Ok
        } else {
            PrivilegeAccess::Fail
        }
    }

    /// Remove a privilege for the remainder of the context's life.
    /// Returns whether the privilege was held.
    pub fn drop_privilege(&mut self, privilege: Privilege) -> bool {
        self.privileges.remove(&privilege)
    }

    /// Grant every bucket-scoped privilege. Only used for bucket 0
    /// ("no-bucket") so those connections see `NoBucket` instead of
    /// `Eaccess`.
    pub fn set_bucket_privileges(&mut self) {
        self.privileges.extend(Privilege::ALL_BUCKET);
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "users": {
            "flusher": {"domain": "local", "internal": true,
                        "buckets": {"*": ["Read", "Upsert", "Remove", "Stats"]}},
            "app": {"domain": "local",
                    "buckets": {"default": ["Read", "Upsert"]}}
        }
    }"#;

    #[test]
    fn context_checks_granted_privileges() {
        let db = RbacDatabase::from_json(CATALOG).unwrap();
        let ctx = db.create_context("app", "default").unwrap();
        assert_eq!(
            ctx.check(Privilege::Read, db.generation()),
            PrivilegeAccess::Ok
        );
        assert_eq!(
            ctx.check(Privilege::Remove, db.generation()),
            PrivilegeAccess::Fail
        );
    }

    #[test]
    fn reload_marks_contexts_stale() {
        let db = RbacDatabase::from_json(CATALOG).unwrap();
        let ctx = db.create_context("app", "default").unwrap();
        db.reload_json(CATALOG).unwrap();
        assert_eq!(
            ctx.check(Privilege::Read, db.generation()),
            PrivilegeAccess::Stale
        );
    }

    #[test]
    fn unknown_bucket_is_rejected() {
        let db = RbacDatabase::from_json(CATALOG).unwrap();
        assert!(matches!(
            db.create_context("app", "other"),
            Err(RbacError::NoSuchBucket { .. })
        ));
    }

    #[test]
    fn drop_privilege_is_sticky() {
        let db = RbacDatabase::from_json(CATALOG).unwrap();
        let mut ctx = db.create_context("app", "default").unwrap();
        assert!(ctx.drop_privilege(Privilege::Read));
        assert_eq!(
            ctx.check(Privilege::Read, db.generation()),
            PrivilegeAccess::Fail
        );
    }
}
