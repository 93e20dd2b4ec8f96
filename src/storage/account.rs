use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;

use super::StorageError;

pub const DEV_ACCOUNT_NAME: &str = "devstoreaccount1";
const DEV_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEV_BLOB_ENDPOINT: &str = "http://127.0.0.1:10000/devstoreaccount1";
const DEV_QUEUE_ENDPOINT: &str = "http://127.0.0.1:10001/devstoreaccount1";

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    SharedKey { account: String, key: Vec<u8> },
    /// SAS query string without the leading `?`.
    Sas(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::SharedKey { account, .. } => f
                .debug_struct("SharedKey")
                .field("account", account)
                .field("key", &"<redacted>")
                .finish(),
            Credentials::Sas(_) => f.write_str("Sas(<redacted>)"),
        }
    }
}

/// Endpoints and credentials resolved from a storage connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageAccount {
    pub account_name: String,
    pub blob_endpoint: String,
    pub queue_endpoint: String,
    pub credentials: Credentials,
}

impl StorageAccount {
    /// The local storage emulator with its well-known account.
    pub fn development() -> Self {
        Self {
            account_name: DEV_ACCOUNT_NAME.to_string(),
            blob_endpoint: DEV_BLOB_ENDPOINT.to_string(),
            queue_endpoint: DEV_QUEUE_ENDPOINT.to_string(),
            credentials: Credentials::SharedKey {
                account: DEV_ACCOUNT_NAME.to_string(),
                // Constant, known to be valid base64.
                key: STANDARD.decode(DEV_ACCOUNT_KEY).unwrap_or_default(),
            },
        }
    }

    pub fn from_connection_string(connection_string: &str) -> Result<Self, StorageError> {
        let settings = parse_settings(connection_string)?;

        if settings
            .get("UseDevelopmentStorage")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        {
            return Ok(Self::development());
        }

        let account_name = settings.get("AccountName").map(|s| s.to_string());
        let protocol = settings
            .get("DefaultEndpointsProtocol")
            .copied()
            .unwrap_or("https");
        let suffix = settings
            .get("EndpointSuffix")
            .copied()
            .unwrap_or("core.windows.net");

        let endpoint = |key: &str, service: &str| -> Result<String, StorageError> {
            if let Some(explicit) = settings.get(key) {
                return Ok(explicit.trim_end_matches('/').to_string());
            }
            match &account_name {
                Some(account) => Ok(format!("{protocol}://{account}.{service}.{suffix}")),
                None => Err(StorageError::InvalidConnectionString(format!(
                    "{key} or AccountName is required"
                ))),
            }
        };
        let blob_endpoint = endpoint("BlobEndpoint", "blob")?;
        let queue_endpoint = endpoint("QueueEndpoint", "queue")?;

        let credentials = match (&account_name, settings.get("AccountKey")) {
            (Some(account), Some(key)) => Credentials::SharedKey {
                account: account.clone(),
                key: STANDARD.decode(key).map_err(|e| {
                    StorageError::InvalidConnectionString(format!(
                        "AccountKey is not valid base64: {e}"
                    ))
                })?,
            },
            (None, Some(_)) => {
                return Err(StorageError::InvalidConnectionString(
                    "AccountKey requires AccountName".to_string(),
                ))
            }
            (_, None) => match settings.get("SharedAccessSignature") {
                Some(sas) => Credentials::Sas(sas.trim_start_matches('?').to_string()),
                None => {
                    return Err(StorageError::InvalidConnectionString(
                        "either AccountKey or SharedAccessSignature is required".to_string(),
                    ))
                }
            },
        };

        Ok(Self {
            account_name: account_name.unwrap_or_default(),
            blob_endpoint,
            queue_endpoint,
            credentials,
        })
    }
}

fn parse_settings(connection_string: &str) -> Result<HashMap<&str, &str>, StorageError> {
    let mut settings = HashMap::new();
    for part in connection_string.split(';').map(str::trim) {
        if part.is_empty() {
            continue;
        }
        let (key, value) = part.split_once('=').ok_or_else(|| {
            StorageError::InvalidConnectionString(format!("malformed setting '{}'", part))
        })?;
        settings.insert(key.trim(), value.trim());
    }
    if settings.is_empty() {
        return Err(StorageError::InvalidConnectionString(
            "connection string is empty".to_string(),
        ));
    }
    Ok(settings)
}
