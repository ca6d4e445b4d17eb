//! Instance creation.
//!
//! The launcher validates operator metadata, assembles the create-instance
//! request, and submits it. The returned [`Instance`] is the raw handle of a
//! guest that is still being built.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::cloud::{Cloud, Instance, ServerCreate};

/// Upper bound on instance metadata entries, including the group tag.
pub const MAX_METADATA_ENTRIES: usize = 5;

/// Metadata key carrying the operator supplied host groups.
pub const GROUPS_METADATA_KEY: &str = "groups";

const NAME_SUFFIX_LEN: usize = 4;

/// Errors raised while validating instance metadata.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum MetadataError {
    /// Explicit metadata plus injected tags exceed the ceiling.
    #[error("metadata has {count} entries, including the group tag; at most {MAX_METADATA_ENTRIES} are allowed")]
    TooLarge {
        /// Number of entries that would have been submitted.
        count: usize,
    },
    /// The metadata argument is not a JSON object of strings.
    #[error("invalid metadata: {message}")]
    Invalid {
        /// Description of the problem.
        message: String,
    },
}

/// Errors raised while launching an instance.
#[derive(Debug, Error)]
pub enum LaunchError<E>
where
    E: std::error::Error + 'static,
{
    /// Metadata failed validation; nothing was submitted.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    /// The create-instance call failed.
    #[error("failed to create instance: {0}")]
    Provider(#[source] E),
}

/// Parses a `--meta` argument: a JSON object whose values are all strings.
///
/// # Errors
///
/// Returns [`MetadataError::Invalid`] for malformed JSON, non-object
/// documents, or non-string values.
pub fn parse_metadata_json(raw: &str) -> Result<BTreeMap<String, String>, MetadataError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|err| MetadataError::Invalid {
            message: err.to_string(),
        })?;
    let serde_json::Value::Object(object) = value else {
        return Err(MetadataError::Invalid {
            message: String::from("metadata must be a JSON object"),
        });
    };

    object
        .into_iter()
        .map(|(key, entry)| match entry {
            serde_json::Value::String(text) => Ok((key, text)),
            other => Err(MetadataError::Invalid {
                message: format!("value of '{key}' must be a string, got {other}"),
            }),
        })
        .collect()
}

/// Merges explicit metadata with the host-group tag and enforces the
/// ceiling.
///
/// Groups are joined with commas under [`GROUPS_METADATA_KEY`]; an empty
/// group list adds nothing.
///
/// # Errors
///
/// Returns [`MetadataError::TooLarge`] when the merged map holds more than
/// [`MAX_METADATA_ENTRIES`] entries.
pub fn build_metadata(
    explicit: BTreeMap<String, String>,
    groups: &[String],
) -> Result<BTreeMap<String, String>, MetadataError> {
    let mut metadata = explicit;
    if !groups.is_empty() {
        metadata.insert(GROUPS_METADATA_KEY.to_owned(), groups.join(","));
    }
    if metadata.len() > MAX_METADATA_ENTRIES {
        return Err(MetadataError::TooLarge {
            count: metadata.len(),
        });
    }
    Ok(metadata)
}

/// Generates `<prefix>-<4 lowercase hex characters>`.
#[must_use]
pub fn generate_name(prefix: &str) -> String {
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(NAME_SUFFIX_LEN)
        .collect();
    format!("{prefix}-{suffix}")
}

/// Validated inputs of a create-instance call.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LaunchRequest {
    /// Instance display name.
    pub name: String,
    /// Resolved image identifier.
    pub image_id: String,
    /// Resolved flavor identifier.
    pub flavor_id: String,
    /// Key pair injected into the guest.
    pub key_name: String,
    /// Cloud-init user data.
    pub user_data: Option<String>,
    /// Explicit metadata, before the group tag is merged in.
    pub metadata: BTreeMap<String, String>,
    /// Host groups recorded under [`GROUPS_METADATA_KEY`].
    pub groups: Vec<String>,
}

impl LaunchRequest {
    /// Builds the create-instance payload, validating metadata first.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError`] when metadata validation fails.
    pub fn to_server_create(&self) -> Result<ServerCreate, MetadataError> {
        let metadata = build_metadata(self.metadata.clone(), &self.groups)?;
        Ok(ServerCreate {
            name: self.name.clone(),
            image_id: self.image_id.clone(),
            flavor_id: self.flavor_id.clone(),
            key_name: self.key_name.clone(),
            user_data: self.user_data.clone(),
            metadata,
        })
    }
}

/// Submits create-instance requests.
#[derive(Debug)]
pub struct Launcher<'a, C> {
    cloud: &'a C,
}

impl<'a, C> Launcher<'a, C>
where
    C: Cloud,
{
    /// Creates a launcher bound to `cloud`.
    #[must_use]
    pub const fn new(cloud: &'a C) -> Self {
        Self { cloud }
    }

    /// Validates and submits `request`, returning as soon as the control
    /// plane accepts it.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::Metadata`] before any call is made when the
    /// metadata is invalid, and [`LaunchError::Provider`] when creation
    /// fails.
    pub async fn launch(&self, request: &LaunchRequest) -> Result<Instance, LaunchError<C::Error>> {
        let payload = request.to_server_create()?;
        let instance = self
            .cloud
            .create_server(&payload)
            .await
            .map_err(LaunchError::Provider)?;
        info!(instance_id = %instance.id, name = %instance.name, "created instance");
        Ok(instance)
    }
}
