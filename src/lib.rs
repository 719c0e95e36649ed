//! SSH access files for a virtual machine hosting platform.
//!
//! Users reach their virtual machines by forwarding a port through a shared SSH account. Which
//! users may forward to which ports is decided by per-instance key files: each instance has a file
//! in the key directory, named after the instance, listing the public keys of the users who may
//! access it.
//!
//! This crate turns those key files, plus the cluster manager's list of instances, into two
//! generated files:
//!
//! - `authorized_keys`, with one restricted line per user that permits forwarding only to that
//!   user's instances' ports and forces a helper command.
//! - `attributes.py`, which maps each user to the instances they may manage, for use by a separate
//!   authorization layer.
//!
//! # Program flow
//!
//! 1. [instance] lists the instances known to the cluster manager, through [api].
//! 2. For each instance, [keyfile] reads its key file. Missing files are skipped.
//! 3. [reconcile] folds every instance's records into one account per user, reporting keys that
//!    are shared between users or that change for a user.
//! 4. [render] turns the accounts into the two files, which [run] writes to the output directory.
//!
//! Every run starts from scratch and overwrites both files, so it is always safe to rerun.

pub mod api;
pub mod config;
pub mod instance;
pub mod keyfile;
pub mod reconcile;
pub mod render;
pub mod run;

#[doc(inline)]
pub use run::run;
