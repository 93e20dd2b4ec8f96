use bytes::Bytes;

use super::{unique, Harness, ScenarioError};
use crate::poll::retry::with_retry;
use crate::poll::wait_for_cancellable;
use crate::storage::try_download_blob;

pub(super) async fn blob_trigger(h: &Harness) -> Result<(), ScenarioError> {
    let name = unique("testBlob");
    let content = Bytes::from(unique("blob-content"));
    let storage = h.storage.as_ref();
    let input = h.resources.input_container.as_str();
    let output = h.resources.output_container.as_str();

    with_retry(&h.retry, "upload_blob", || {
        storage.upload_blob(input, &name, content.clone())
    })
    .await?;

    let (copied, _) = wait_for_cancellable(
        &h.policy,
        &h.cancel,
        || try_download_blob(storage, output, &name),
        || format!("blob '{}' in container '{}'", name, output),
    )
    .await?;

    if copied != content {
        return Err(ScenarioError::mismatch(
            format!("content of blob '{}/{}'", output, name),
            String::from_utf8_lossy(&content),
            String::from_utf8_lossy(&copied),
        ));
    }
    Ok(())
}
