// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The process-wide reprovision failure lock.
//!
//! When a reprovision fails, the reason is recorded in a file under the
//! working directory.  Later changes consult it before starting so a plan
//! does not grind through repeated doomed attempts; the operator clears it
//! by fixing the cause and removing the file (a successful reprovision
//! also clears it).

use crate::ProcedureError;
use camino::{Utf8Path, Utf8PathBuf};

const LOCKFILE_NAME: &str = "reprovision-failure.lock";

pub(crate) fn lockfile_path(workdir: &Utf8Path) -> Utf8PathBuf {
    workdir.join(LOCKFILE_NAME)
}

/// Fails with a validation error if a previous reprovision failure is on
/// record.
pub(crate) async fn check(workdir: &Utf8Path) -> Result<(), ProcedureError> {
    let path = lockfile_path(workdir);
    match tokio::fs::read_to_string(&path).await {
        Ok(reason) => Err(ProcedureError::Validation(format!(
            "a previous reprovision is failing: {}; fix the cause and \
             remove {} to retry",
            reason.trim(),
            path,
        ))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ProcedureError::Io { path, err }),
    }
}

pub(crate) async fn set(
    workdir: &Utf8Path,
    reason: &str,
) -> Result<(), ProcedureError> {
    let path = lockfile_path(workdir);
    tokio::fs::write(&path, reason)
        .await
        .map_err(|err| ProcedureError::Io { path, err })
}

pub(crate) async fn clear(workdir: &Utf8Path) -> Result<(), ProcedureError> {
    let path = lockfile_path(workdir);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ProcedureError::Io { path, err }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    #[tokio::test]
    async fn records_and_clears_failures() {
        let dir = Utf8TempDir::new().unwrap();
        check(dir.path()).await.unwrap();

        set(dir.path(), "reprovision of catalog0 failed: quota exceeded")
            .await
            .unwrap();
        let err = check(dir.path()).await.unwrap_err();
        match err {
            ProcedureError::Validation(message) => {
                assert!(message.contains("quota exceeded"), "{message}");
                assert!(
                    message.contains(LOCKFILE_NAME),
                    "message should name the lockfile: {message}"
                );
            }
            other => panic!("expected validation error, got {other}"),
        }

        clear(dir.path()).await.unwrap();
        check(dir.path()).await.unwrap();
        // Clearing twice is fine.
        clear(dir.path()).await.unwrap();
    }
}
