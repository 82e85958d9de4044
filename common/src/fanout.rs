// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded parallel fan-out for independent per-host work.
//!
//! A procedure step that touches several hosts (installing an image on every
//! server, reprovisioning ensemble followers) dispatches one future per host
//! through [`fanout`].  All branches are allowed to finish before the step
//! reports, so partial successes are never masked by the first failure;
//! independent failures aggregate into a single [`MultiError`].

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// The default number of parallel branches.
pub const DEFAULT_MAX_PARALLELISM: usize = 8;

/// Aggregates the failures of independent parallel branches.
#[derive(Debug)]
pub struct MultiError {
    errors: Vec<anyhow::Error>,
}

impl MultiError {
    pub fn new(errors: Vec<anyhow::Error>) -> MultiError {
        assert!(!errors.is_empty(), "MultiError requires at least one error");
        MultiError { errors }
    }

    pub fn errors(&self) -> &[anyhow::Error] {
        &self.errors
    }
}

impl std::fmt::Display for MultiError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} operation(s) failed:", self.errors.len())?;
        for error in &self.errors {
            write!(f, " [{error:#}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

/// Runs every future in `tasks`, at most `max_parallelism` at a time, and
/// collects all results.
///
/// Unlike racing combinators, this never abandons a dispatched branch: every
/// branch runs to completion even when a sibling has already failed.  If any
/// branch fails, the successes are discarded and all failures are returned
/// together.  Results are in completion order, not dispatch order.
pub async fn fanout<T, E, I, F>(
    max_parallelism: usize,
    tasks: I,
) -> Result<Vec<T>, MultiError>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_parallelism));
    let mut set = JoinSet::new();
    for task in tasks {
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => unreachable!("we never close the semaphore"),
            };
            task.await.map_err(Into::into)
        });
    }

    let mut completed = Vec::new();
    let mut errors = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(value)) => completed.push(value),
            Ok(Err(error)) => errors.push(error),
            Err(join_error) => {
                errors.push(anyhow::Error::new(join_error))
            }
        }
    }

    if errors.is_empty() {
        Ok(completed)
    } else {
        Err(MultiError::new(errors))
    }
}
