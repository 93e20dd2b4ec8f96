use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::ResourceArgs;
use crate::config::Config;
use crate::fixture::{Resources, StorageFixture};
use crate::storage::{AzureStorageClient, StorageBackend};

/// Config with command line overrides applied.
pub(super) fn resolve_config(args: &ResourceArgs) -> Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(connection_string) = &args.connection_string {
        config.storage.connection_string = connection_string.clone();
    }
    if let Some(suffix) = &args.suffix {
        config.resources.suffix = suffix.clone();
    }
    Ok(config)
}

pub(super) fn connect_storage(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let client = AzureStorageClient::from_connection_string(&config.storage.connection_string)
        .context("Failed to configure storage client")?
        .with_message_encoding(config.storage.message_encoding);
    eprintln!("    Queue endpoint: {}", client.account().queue_endpoint);
    eprintln!("    Blob endpoint:  {}", client.account().blob_endpoint);
    Ok(Arc::new(client))
}

pub async fn execute_setup(args: ResourceArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    let resources = Resources::with_suffix(&config.resources.suffix);

    eprintln!("==> Creating shared resources");
    let storage = connect_storage(&config)?;
    StorageFixture::setup(storage, resources.clone(), &CancellationToken::new())
        .await
        .context("Failed to create shared resources")?;

    for queue in resources.queues() {
        eprintln!("    queue:     {}", queue);
    }
    for container in resources.containers() {
        eprintln!("    container: {}", container);
    }
    Ok(())
}

pub async fn execute_teardown(args: ResourceArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    let resources = Resources::with_suffix(&config.resources.suffix);

    eprintln!("==> Deleting shared resources");
    let storage = connect_storage(&config)?;
    StorageFixture::attach(storage, resources, &CancellationToken::new())
        .teardown()
        .await
        .context("Failed to delete shared resources")?;
    eprintln!("    Deleted");
    Ok(())
}
