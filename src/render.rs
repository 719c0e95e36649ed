//! Renders the two generated artifacts from a finished [Reconciler].
//!
//! Both renderers are pure: the same accounts in the same order always produce byte-identical
//! output. Writing the output is left to the caller.

use crate::reconcile::{Reconciler, UserAccount};
use shlex::Quoter;
use std::borrow::Cow;
use std::fmt::Write;
use tracing::error;

/// Options that precede the port list on every `authorized_keys` line.
pub const RESTRICTIONS: &str = "no-agent-forwarding,no-user-rc,no-X11-forwarding";

/// The pseudo-user that always appears, with no access, at the top of the attributes file.
pub const UNAUTHENTICATED_USER: &str = "unauthenticated_user";

/// The access template every granted instance refers to.
pub const STANDARD_TEMPLATE: &str = "standard";

const ATTRIBUTES_HEADER: &str = "\
# ACL mapping permissions to domains for various users
from templates import *

ATTRIBUTES = {
";

/// Formats a `permitopen` option that allows forwarding to `port` on localhost.
pub fn permit_open(port: u16) -> String {
    format!("permitopen=\"localhost:{port}\"")
}

/// Renders the `authorized_keys` line for one account.
///
/// The line restricts the key to forwarding the account's ports and forces `helper` to run with
/// the user's ID as its only argument:
///
/// ```text
/// no-agent-forwarding,no-user-rc,no-X11-forwarding,permitopen="localhost:2221",command="exec <helper> <user>" <type> <key> <user>
/// ```
///
/// Returns [None] if the user ID cannot be passed safely to a shell, e.g. because it contains a
/// NUL byte.
pub fn authorized_keys_line(account: &UserAccount, helper: &str) -> Option<String> {
    let user = account.user();
    let quoted = shell_quote(user)?;
    // Inside the option's double quotes, sshd treats \" as a literal quote.
    let command = format!("exec {helper} {quoted}").replace('"', "\\\"");

    let mut options = vec![RESTRICTIONS.to_owned()];
    options.extend(account.ports().iter().map(|&port| permit_open(port)));
    options.push(format!("command=\"{command}\""));

    let key = account.key();
    Some(format!(
        "{} {} {} {user}",
        options.join(","),
        key.key_type,
        key.material,
    ))
}

fn shell_quote(user: &str) -> Option<Cow<'_, str>> {
    Quoter::new().quote(user).ok()
}

/// The accounts both artifacts are rendered from, in encounter order.
///
/// A user ID that can't be passed to the forced command gets no access at all, so the account is
/// logged and left out of both files.
pub fn renderable_accounts(reconciler: &Reconciler) -> impl Iterator<Item = &UserAccount> {
    reconciler.users().filter(|account| {
        let ok = shell_quote(account.user()).is_some();
        if !ok {
            error!(
                user = ?account.user(),
                "user ID cannot be quoted for the forced command; leaving it out",
            );
        }
        ok
    })
}

/// Renders the whole `authorized_keys` file, one line per account in encounter order.
///
/// Accounts left out by [renderable_accounts] produce no line.
pub fn authorized_keys(reconciler: &Reconciler, helper: &str) -> String {
    let mut out = String::new();
    for line in renderable_accounts(reconciler)
        .filter_map(|account| authorized_keys_line(account, helper))
    {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Renders the attributes file: a Python module defining `ATTRIBUTES`, which maps each user to
/// the instances they may access and the template that governs that access.
pub fn attributes(reconciler: &Reconciler) -> String {
    let mut out = String::from(ATTRIBUTES_HEADER);
    // Writing to a String can't fail.
    let _ = writeln!(out, "  {}: {{\n  }},", py_str(UNAUTHENTICATED_USER));

    for account in renderable_accounts(reconciler) {
        let _ = writeln!(out, "  {}: {{", py_str(account.user()));
        for instance in account.instances() {
            let _ = writeln!(
                out,
                "    {}: TEMPLATES[{}],",
                py_str(instance),
                py_str(STANDARD_TEMPLATE),
            );
        }
        out.push_str("  },\n");
    }

    out.push_str("}\n");
    out
}

/// Formats `s` as a single-quoted Python string literal. Control characters are escaped, so the
/// literal never carries a raw NUL or line break into the module source.
fn py_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if c.is_ascii_control() => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}
