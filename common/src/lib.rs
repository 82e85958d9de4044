// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared building blocks for the cpadm update engine: the poll-until
//! combinator underlying every waiter, and the bounded parallel fan-out used
//! for independent per-host work.

pub mod fanout;
pub mod poll;
