// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persisted boot-script rollback artifacts.
//!
//! Before a change pushes a new boot script, the previous content is
//! written under the working directory keyed by (service, image), where
//! `image` is the image the service ran at the time.  A later
//! rollback-service change to that image reads it back.

use crate::ProcedureError;
use camino::{Utf8Path, Utf8PathBuf};
use uuid::Uuid;

fn artifact_dir(workdir: &Utf8Path) -> Utf8PathBuf {
    workdir.join("rollback")
}

fn artifact_path(
    workdir: &Utf8Path,
    service: &str,
    image: &Uuid,
) -> Utf8PathBuf {
    artifact_dir(workdir).join(format!("{service}-{image}.bootscript"))
}

pub(crate) async fn save(
    workdir: &Utf8Path,
    service: &str,
    image: &Uuid,
    content: &str,
) -> Result<Utf8PathBuf, ProcedureError> {
    let dir = artifact_dir(workdir);
    let path = artifact_path(workdir, service, image);
    tokio::fs::create_dir_all(&dir).await.map_err(|err| {
        ProcedureError::Io { path: dir.clone(), err }
    })?;
    tokio::fs::write(&path, content).await.map_err(|err| {
        ProcedureError::Io { path: path.clone(), err }
    })?;
    Ok(path)
}

pub(crate) async fn load(
    workdir: &Utf8Path,
    service: &str,
    image: &Uuid,
) -> Result<Option<String>, ProcedureError> {
    let path = artifact_path(workdir, service, image);
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(ProcedureError::Io { path, err }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    #[tokio::test]
    async fn round_trips_and_distinguishes_keys() {
        let dir = Utf8TempDir::new().unwrap();
        let image_a = Uuid::new_v4();
        let image_b = Uuid::new_v4();

        assert_eq!(
            load(dir.path(), "catalog", &image_a).await.unwrap(),
            None
        );
        save(dir.path(), "catalog", &image_a, "#!/bin/bash\nsetup-a\n")
            .await
            .unwrap();
        assert_eq!(
            load(dir.path(), "catalog", &image_a).await.unwrap().unwrap(),
            "#!/bin/bash\nsetup-a\n"
        );
        assert_eq!(
            load(dir.path(), "catalog", &image_b).await.unwrap(),
            None
        );
        assert_eq!(
            load(dir.path(), "gateway", &image_a).await.unwrap(),
            None
        );
    }
}
