use crate::{
    assets::{AssetSource, WEBIDE_DIR},
    errors::OrchestratorError,
};
use std::path::Path;

/// Lay out a workspace directly on the host, for when no backend exists
pub async fn prepare_workspace(
    workspace: &Path,
    assets: &dyn AssetSource,
) -> Result<(), OrchestratorError> {
    for dir in &["projects", "ai", WEBIDE_DIR] {
        tokio::fs::create_dir_all(workspace.join(dir)).await?;
    }
    let webide = workspace.join(WEBIDE_DIR);
    for name in assets.list(WEBIDE_DIR)? {
        let data = assets.read(&format!("{}/{}", WEBIDE_DIR, name))?;
        tokio::fs::write(webide.join(&name), data).await?;
        log::debug!("copied asset {} into {:?}", name, webide);
    }
    Ok(())
}
