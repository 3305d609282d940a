use std::path::PathBuf;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Client,
    api::{ObjectMeta, PostParams},
};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{Level, instrument};

use crate::{
    Error, Result,
    api::{CLUSTER_NAME_LABEL, NodeGroup},
};

const PUBLIC_KEY_DATA_KEY: &str = "ssh-publickey";
const FINGERPRINT_ANNOTATION: &str = "ngctl.io/key-fingerprint";

/// Reference to key material known to the infrastructure provider
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct KeyHandle {
    pub name: String,
    pub fingerprint: String,
}

/// Provisions or loads access-key material for a nodegroup
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn ensure_key(&self, cluster_name: &str, unit: &NodeGroup) -> Result<KeyHandle>;
}

/// Storage for imported public keys
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    async fn find(&self, name: &str) -> Result<Option<KeyHandle>>;
    async fn import(&self, cluster_name: &str, handle: &KeyHandle, key: &PublicKey) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    pub algorithm: String,
    pub blob: Vec<u8>,
    /// The key in `authorized_keys` format, without comment
    pub encoded: String,
}

impl PublicKey {
    /// Parse a key in OpenSSH `authorized_keys` format
    pub fn parse(text: &str) -> Result<Self> {
        let mut fields = text.split_whitespace();
        let (Some(algorithm), Some(data)) = (fields.next(), fields.next()) else {
            return Err(Error::validation("public key must be in OpenSSH format"));
        };

        let blob = STANDARD
            .decode(data)
            .map_err(|e| Error::validation(format!("decoding public key: {e}")))?;

        // The blob starts with the length-prefixed algorithm name.
        let embedded = blob
            .get(..4)
            .map(|len| u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize)
            .and_then(|len| blob.get(4..4 + len));
        if embedded != Some(algorithm.as_bytes()) {
            return Err(Error::validation(format!(
                "public key data does not match declared algorithm {algorithm:?}"
            )));
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            encoded: format!("{algorithm} {data}"),
            blob,
        })
    }

    /// Colon separated hex SHA-256 of the key blob
    pub fn fingerprint(&self) -> String {
        Sha256::digest(&self.blob)
            .iter()
            .map(|b| hex::encode([*b]))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Deterministic key name, so identical keys are shared across nodegroups of a cluster
pub fn key_name(cluster_name: &str, fingerprint: &str) -> String {
    format!("ngctl-{cluster_name}-{}", fingerprint.replace(':', ""))
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

/// Reads public keys from disk and imports them into a [`KeyRegistry`] once
pub struct KeyStore<R> {
    registry: R,
}

impl<R: KeyRegistry> KeyStore<R> {
    pub fn new(registry: R) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl<R: KeyRegistry> KeyProvider for KeyStore<R> {
    #[instrument(level = Level::DEBUG, skip(self, unit), fields(nodegroup = %unit.name))]
    async fn ensure_key(&self, cluster_name: &str, unit: &NodeGroup) -> Result<KeyHandle> {
        let path = expand_home(&unit.ssh_public_key_path);
        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            Error::resolution(&unit.name, format!("reading {}: {e}", path.display()))
        })?;
        let key = PublicKey::parse(&text).map_err(|e| Error::resolution(&unit.name, e))?;

        let fingerprint = key.fingerprint();
        let name = key_name(cluster_name, &fingerprint);

        if let Some(existing) = self.registry.find(&name).await? {
            tracing::info!(
                "using existing SSH public key {:?} ({})",
                existing.name,
                existing.fingerprint
            );
            return Ok(existing);
        }

        let handle = KeyHandle { name, fingerprint };
        self.registry.import(cluster_name, &handle, &key).await?;
        tracing::info!(
            "imported SSH public key {:?} as {:?} ({})",
            path.display(),
            handle.name,
            handle.fingerprint
        );
        Ok(handle)
    }
}

/// Keeps imported keys as Secrets next to the cluster's infrastructure objects
pub struct SecretKeyRegistry {
    secrets: Api<Secret>,
}

impl SecretKeyRegistry {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            secrets: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl KeyRegistry for SecretKeyRegistry {
    async fn find(&self, name: &str) -> Result<Option<KeyHandle>> {
        let Some(secret) = self.secrets.get_opt(name).await? else {
            return Ok(None);
        };

        let fingerprint = secret
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(FINGERPRINT_ANNOTATION))
            .cloned()
            .unwrap_or_default();

        Ok(Some(KeyHandle {
            name: name.to_string(),
            fingerprint,
        }))
    }

    async fn import(&self, cluster_name: &str, handle: &KeyHandle, key: &PublicKey) -> Result<()> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(handle.name.clone()),
                labels: Some([(CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string())].into()),
                annotations: Some(
                    [(FINGERPRINT_ANNOTATION.to_string(), handle.fingerprint.clone())].into(),
                ),
                ..Default::default()
            },
            string_data: Some([(PUBLIC_KEY_DATA_KEY.to_string(), key.encoded.clone())].into()),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };

        match self.secrets.create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            // Imported concurrently under the same deterministic name
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
