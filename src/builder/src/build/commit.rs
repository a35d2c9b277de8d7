//! Stage commit.

use chrono::Utc;
use kiln_core::error::{KilnError, Result};

use super::stage::{StageBuilder, StageState};
use crate::oci::{CommitOptions, ImageStore};

/// Prefix of the throwaway name an image carries while it is committed.
const TEMP_NAME_PREFIX: &str = "kiln-tmp-";

/// Commit the stage's container if the stage needs it, otherwise hand the
/// base image on unchanged.
///
/// `dockerfile_digest` is recorded as the image's container ID so that
/// builds of the same Dockerfile can be told apart from other images.
pub async fn commit_stage(
    store: &dyn ImageStore,
    stage: &mut StageBuilder,
    dockerfile_digest: &str,
) -> Result<()> {
    if !stage.page.need_commit {
        stage.image_id = stage.base_image_id.clone();
        stage.mark_done(StageState::Reused);
        return Ok(());
    }

    let container_id = stage
        .container
        .as_ref()
        .map(|c| c.id.clone())
        .ok_or_else(|| KilnError::Store(format!("stage {} has no container", stage.name)))?;

    let created = Utc::now();
    stage.doc.created = Some(created);
    let options = CommitOptions {
        name: Some(format!(
            "{}{}",
            TEMP_NAME_PREFIX,
            uuid::Uuid::new_v4().simple()
        )),
        created_by: stage
            .page
            .lines
            .last()
            .map(|l| l.text())
            .unwrap_or_default(),
        config: stage.doc.to_bytes()?,
        container_id: dockerfile_digest.to_string(),
        created,
    };

    let image_id = store.commit(&container_id, options).await?;
    store.set_names(&image_id, &[]).await?;

    tracing::info!(stage = %stage.name, image = %image_id, "Committed stage");
    stage.image_id = Some(image_id);
    stage.mark_done(StageState::Committed);
    Ok(())
}
