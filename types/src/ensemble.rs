// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-node coordination-ensemble state, as reported by the four-letter
//! `srvr` probe.

use std::net::IpAddr;

/// The mode one ensemble node reports.
///
/// A healthy multi-node ensemble has exactly one leader; a single-node
/// ensemble runs standalone.  `Transitioning` covers every state in which
/// the node cannot (yet) say: it is restarting, syncing, or simply not
/// answering its probe port.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnsembleMode {
    Leader,
    Follower,
    Standalone,
    Transitioning,
}

impl EnsembleMode {
    /// Extracts the mode from `srvr` probe output.  Output without a
    /// recognizable `Mode:` line maps to [`EnsembleMode::Transitioning`],
    /// since that is exactly what a restarting node produces.
    pub fn parse_srvr(stdout: &str) -> EnsembleMode {
        for line in stdout.lines() {
            let Some(mode) = line.trim().strip_prefix("Mode:") else {
                continue;
            };
            return match mode.trim() {
                "leader" => EnsembleMode::Leader,
                "follower" => EnsembleMode::Follower,
                "standalone" => EnsembleMode::Standalone,
                _ => EnsembleMode::Transitioning,
            };
        }
        EnsembleMode::Transitioning
    }
}

impl std::fmt::Display for EnsembleMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            EnsembleMode::Leader => "leader",
            EnsembleMode::Follower => "follower",
            EnsembleMode::Standalone => "standalone",
            EnsembleMode::Transitioning => "transitioning",
        };
        write!(f, "{s}")
    }
}

/// The observed state of one ensemble node.
#[derive(Clone, Debug)]
pub struct EnsembleNodeState {
    pub ip: IpAddr,
    pub mode: EnsembleMode,
}
