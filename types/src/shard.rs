// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The replication topology of a database shard, as reported by `shardctl`
//! on a live member.
//!
//! Two wire formats are in the field.  Newer shard images support
//! `shardctl peers -H -o role,peer,pg,repl`, which emits one
//! pipe-separated record per peer.  Older images only have
//! `shardctl status`, a whitespace-aligned table with a header row.  Both
//! normalize to [`ShardState`].

use anyhow::{anyhow, bail, Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The role a peer plays in the shard's replication chain.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ShardRole {
    Primary,
    Sync,
    Async,
}

impl std::fmt::Display for ShardRole {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            ShardRole::Primary => "primary",
            ShardRole::Sync => "sync",
            ShardRole::Async => "async",
        };
        write!(f, "{s}")
    }
}

/// Postgres liveness of one peer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PgStatus {
    Ok,
    Down,
}

impl PgStatus {
    fn parse(field: &str) -> PgStatus {
        // Anything other than a positive "ok" ("down", "-", an error
        // string) means the peer is not serving.
        if field.eq_ignore_ascii_case("ok") {
            PgStatus::Ok
        } else {
            PgStatus::Down
        }
    }
}

/// What a peer reports about its downstream replication connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplStatus {
    Sync,
    Async,
    Absent,
}

impl ReplStatus {
    fn parse(field: &str) -> Result<ReplStatus> {
        match field {
            "sync" => Ok(ReplStatus::Sync),
            "async" => Ok(ReplStatus::Async),
            "-" | "" => Ok(ReplStatus::Absent),
            other => bail!("unrecognized replication status {other:?}"),
        }
    }
}

/// One peer's row in the shard topology.
#[derive(Clone, Debug)]
pub struct PeerState {
    /// The abbreviated peer name (the first 8 characters of the member's
    /// zonename).
    pub peer: String,
    pub pg_status: PgStatus,
    pub repl_status: ReplStatus,
}

/// The full replication topology of one shard.
///
/// At most one peer is primary.  A deposed peer never re-enters the
/// topology without a manual rebuild; its presence is a terminal condition
/// for any update in flight.
#[derive(Clone, Debug, Default)]
pub struct ShardState {
    pub primary: Option<PeerState>,
    pub sync: Option<PeerState>,
    pub async_peers: Vec<PeerState>,
    pub deposed: Vec<PeerState>,
}

impl ShardState {
    /// Parses the modern machine-readable form: one peer per line, fields
    /// separated by `|` in the order role, peer, pg, repl.
    pub fn parse_fields(stdout: &str) -> Result<ShardState> {
        let mut state = ShardState::default();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('|').collect();
            let &[role, peer, pg, repl] = fields.as_slice() else {
                bail!(
                    "expected 4 pipe-separated fields, got {} in {line:?}",
                    fields.len()
                );
            };
            state.push_peer(role, peer, pg, repl)?;
        }
        state.validate()?;
        Ok(state)
    }

    /// Parses the legacy human-readable table: a `ROLE PEER PG REPL` header
    /// followed by whitespace-aligned rows.
    pub fn parse_table(stdout: &str) -> Result<ShardState> {
        let mut lines = stdout.lines().filter(|l| !l.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| anyhow!("empty shard status output"))?;
        if !header.trim_start().starts_with("ROLE") {
            bail!("expected table header starting with ROLE, got {header:?}");
        }
        let mut state = ShardState::default();
        for line in lines {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let &[role, peer, pg, repl] = fields.as_slice() else {
                bail!(
                    "expected 4 columns, got {} in {line:?}",
                    fields.len()
                );
            };
            state.push_peer(role, peer, pg, repl)?;
        }
        state.validate()?;
        Ok(state)
    }

    fn push_peer(
        &mut self,
        role: &str,
        peer: &str,
        pg: &str,
        repl: &str,
    ) -> Result<()> {
        let peer_state = PeerState {
            peer: peer.to_string(),
            pg_status: PgStatus::parse(pg),
            repl_status: ReplStatus::parse(repl)
                .with_context(|| format!("peer {peer:?}"))?,
        };
        match role {
            "primary" => {
                if self.primary.is_some() {
                    bail!("shard reports more than one primary");
                }
                self.primary = Some(peer_state);
            }
            "sync" => {
                if self.sync.is_some() {
                    bail!("shard reports more than one sync peer");
                }
                self.sync = Some(peer_state);
            }
            "async" => self.async_peers.push(peer_state),
            "deposed" => self.deposed.push(peer_state),
            other => bail!("unrecognized peer role {other:?}"),
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.primary.is_none()
            && self.sync.is_none()
            && self.async_peers.is_empty()
            && self.deposed.is_empty()
        {
            bail!("shard status listed no peers");
        }
        Ok(())
    }

    /// Looks up a peer row by abbreviated peer name, across every role.
    pub fn peer(&self, abbr: &str) -> Option<&PeerState> {
        self.primary
            .iter()
            .chain(self.sync.iter())
            .chain(self.async_peers.iter())
            .chain(self.deposed.iter())
            .find(|p| p.peer == abbr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_modern_form() {
        let stdout = "\
primary|11111111|ok|sync
sync|22222222|ok|async
async|33333333|ok|async
async|44444444|ok|-
";
        let state = ShardState::parse_fields(stdout).unwrap();
        let primary = state.primary.unwrap();
        assert_eq!(primary.peer, "11111111");
        assert_eq!(primary.pg_status, PgStatus::Ok);
        assert_eq!(primary.repl_status, ReplStatus::Sync);
        let sync = state.sync.unwrap();
        assert_eq!(sync.repl_status, ReplStatus::Async);
        assert_eq!(state.async_peers.len(), 2);
        assert_eq!(
            state.async_peers[1].repl_status,
            ReplStatus::Absent
        );
        assert!(state.deposed.is_empty());
    }

    #[test]
    fn parses_the_legacy_table() {
        let stdout = "\
ROLE      PEER      PG    REPL
primary   11111111  ok    sync
sync      22222222  ok    -
deposed   55555555  down  -
";
        let state = ShardState::parse_table(stdout).unwrap();
        assert!(state.primary.is_some());
        assert_eq!(state.async_peers.len(), 0);
        assert_eq!(state.deposed.len(), 1);
        assert_eq!(state.deposed[0].peer, "55555555");
        assert_eq!(state.deposed[0].pg_status, PgStatus::Down);
    }

    #[test]
    fn down_and_dash_both_mean_not_serving() {
        let stdout = "\
primary|11111111|ok|sync
sync|22222222|down|-
async|33333333|-|-
";
        let state = ShardState::parse_fields(stdout).unwrap();
        assert_eq!(state.sync.unwrap().pg_status, PgStatus::Down);
        assert_eq!(state.async_peers[0].pg_status, PgStatus::Down);
    }

    #[test]
    fn rejects_two_primaries() {
        let stdout = "\
primary|11111111|ok|sync
primary|22222222|ok|sync
";
        let err = ShardState::parse_fields(stdout).unwrap_err();
        assert!(
            err.to_string().contains("more than one primary"),
            "{err}"
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(ShardState::parse_fields("primary|x|ok").is_err());
        assert!(ShardState::parse_table("nonsense\n").is_err());
        assert!(ShardState::parse_table("").is_err());
        assert!(ShardState::parse_fields("").is_err());
    }

    #[test]
    fn peer_lookup_spans_all_roles() {
        let stdout = "\
primary|11111111|ok|sync
sync|22222222|ok|async
async|33333333|ok|-
deposed|44444444|down|-
";
        let state = ShardState::parse_fields(stdout).unwrap();
        for abbr in ["11111111", "22222222", "33333333", "44444444"] {
            assert!(state.peer(abbr).is_some(), "missing {abbr}");
        }
        assert!(state.peer("99999999").is_none());
    }
}
