//! Merges per-instance key records into one account per user.
//!
//! The [Reconciler] is fed one instance at a time, in the order the cluster manager lists them.
//! For each user it keeps the first key it sees, every port the user was granted, and the set of
//! instances the user may reach.
//!
//! Two conditions are reported but never block the run:
//!
//! - The same key material shows up under two different users ([Conflict::DuplicateKey]). sshd
//!   will silently use whichever entry it reads first.
//! - A user who already has a key shows up with a different one ([Conflict::KeyMismatch]). The
//!   first key stays; the new one is dropped.

use crate::keyfile::KeyRecord;
use indexmap::map::Entry;
use indexmap::{IndexMap, IndexSet};
use std::fmt;
use tracing::error;

/// How many trailing characters of a key to show in diagnostics.
const KEY_SUFFIX_LEN: usize = 20;

/// An SSH public key, without options or comment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshKey {
    pub key_type: String,
    pub material: String,
}

/// Everything we know about one user after reconciliation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserAccount {
    user: String,
    key: SshKey,
    ports: Vec<u16>,
    instances: IndexSet<String>,
}

impl UserAccount {
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The user's canonical key: the first one seen.
    pub fn key(&self) -> &SshKey {
        &self.key
    }

    /// Ports the user may forward to, in the order they were granted.
    ///
    /// A port appears once per grant, so duplicates are possible.
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Instances the user may access, in the order they were first granted.
    pub fn instances(&self) -> impl Iterator<Item = &str> {
        self.instances.iter().map(String::as_str)
    }
}

/// A problem noticed during reconciliation. Reporting only; never fatal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Conflict {
    /// `user` is new, but its key already belongs to `existing_user`.
    DuplicateKey {
        user: String,
        existing_user: String,
        key_suffix: String,
    },

    /// `user` already has a key, and the one in `instance`'s key file differs.
    KeyMismatch { user: String, instance: String },
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::DuplicateKey {
                user,
                existing_user,
                key_suffix,
            } => write!(
                f,
                "the SSH key ...{key_suffix} is present multiple times; sshd will only use the \
                 first one it encounters. {user} and {existing_user} at least are using the same \
                 key",
            ),
            Conflict::KeyMismatch { user, instance } => write!(
                f,
                "already saw a key for user {user} and it doesn't match the key in {instance}",
            ),
        }
    }
}

/// Accumulates [UserAccount]s across all instances of a run.
#[derive(Clone, Debug, Default)]
pub struct Reconciler {
    /// Accounts keyed by user, in the order users were first seen.
    users: IndexMap<String, UserAccount>,

    /// Maps key material to the first user that presented it.
    key_owners: IndexMap<String, String>,

    /// Every conflict reported so far.
    conflicts: Vec<Conflict>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one instance's key records into the accounts.
    ///
    /// Records are processed in order. Every record grants its user `port` and `instance`, even
    /// when its key conflicts with what we've already seen, and even when the same user appears
    /// more than once in `records`.
    ///
    /// # Returns
    ///
    /// The conflicts found in this call. They are also logged and kept in [Self::conflicts].
    pub fn accumulate(
        &mut self,
        instance: &str,
        port: u16,
        records: &[KeyRecord],
    ) -> Vec<Conflict> {
        let mut found = Vec::new();

        for record in records {
            let account = match self.users.entry(record.user.clone()) {
                Entry::Occupied(entry) => {
                    let account = entry.into_mut();
                    if account.key.material != record.key_material {
                        found.push(Conflict::KeyMismatch {
                            user: record.user.clone(),
                            instance: instance.to_owned(),
                        });
                    }
                    account
                }
                Entry::Vacant(entry) => {
                    match self.key_owners.get(&record.key_material) {
                        Some(existing_user) => found.push(Conflict::DuplicateKey {
                            user: record.user.clone(),
                            existing_user: existing_user.clone(),
                            key_suffix: key_suffix(&record.key_material).to_owned(),
                        }),
                        None => {
                            self.key_owners
                                .insert(record.key_material.clone(), record.user.clone());
                        }
                    }

                    entry.insert(UserAccount {
                        user: record.user.clone(),
                        key: SshKey {
                            key_type: record.key_type.clone(),
                            material: record.key_material.clone(),
                        },
                        ports: Vec::new(),
                        instances: IndexSet::new(),
                    })
                }
            };

            account.ports.push(port);
            account.instances.insert(instance.to_owned());
        }

        for conflict in &found {
            error!(%instance, "{conflict}");
        }
        self.conflicts.extend(found.iter().cloned());
        found
    }

    /// Accounts in the order their users were first seen.
    pub fn users(&self) -> impl Iterator<Item = &UserAccount> {
        self.users.values()
    }

    pub fn user(&self, user: &str) -> Option<&UserAccount> {
        self.users.get(user)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Every conflict reported since this [Reconciler] was created.
    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }
}

/// The last [KEY_SUFFIX_LEN] characters of `material`, or all of it if it's shorter.
fn key_suffix(material: &str) -> &str {
    let start = material
        .char_indices()
        .rev()
        .nth(KEY_SUFFIX_LEN - 1)
        .map_or(0, |(i, _)| i);
    &material[start..]
}
