use std::collections::BTreeSet;

/// What to do with an account that just joined a room.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinDecision {
    /// Home server is on the allow-list.
    Allowed,
    /// Would be moderated, but dry-run mode only logs it.
    DryRun,
    Moderate,
}

/// Allow-list check for joining accounts.
#[derive(Clone, Debug, Default)]
pub struct JoinPolicy {
    allowed_servers: BTreeSet<String>,
    dry_run: bool,
}

impl JoinPolicy {
    pub fn new(allowed_servers: BTreeSet<String>, dry_run: bool) -> Self {
        Self {
            allowed_servers,
            dry_run,
        }
    }

    pub fn should_allow(&self, joining_server: &str) -> bool {
        should_allow(joining_server, &self.allowed_servers, self.dry_run)
    }

    pub fn decide(&self, joining_server: &str) -> JoinDecision {
        if self.should_allow(joining_server) {
            JoinDecision::Allowed
        } else if self.dry_run {
            JoinDecision::DryRun
        } else {
            JoinDecision::Moderate
        }
    }
}

/// True iff `joining_server` is on the allow-list.
///
/// `dry_run` never changes the answer; it only decides whether a negative
/// answer leads to an action (see [`JoinPolicy::decide`]).
pub fn should_allow(
    joining_server: &str,
    allowed_servers: &BTreeSet<String>,
    dry_run: bool,
) -> bool {
    let _ = dry_run;
    allowed_servers.contains(joining_server)
}
