//! Flat-file inventory cache.
//!
//! `cache build` snapshots instances, security groups, and images of each
//! project into `<cache_dir>/{instances,secgroups,images}_<project>`; the
//! read side lists instances from the snapshot without calling the cloud.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::cloud::{AddressKind, Cloud, Image, Instance, SecurityGroup};

/// File name prefix of instance snapshots.
pub const INSTANCES_PREFIX: &str = "instances_";
/// File name prefix of security-group snapshots.
pub const SECGROUPS_PREFIX: &str = "secgroups_";
/// File name prefix of image snapshots.
pub const IMAGES_PREFIX: &str = "images_";

const NO_PUBLIC_IPS: &str = "[NO_PUBLIC_IPS]";

/// Errors raised while reading or writing cache files.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CacheError {
    /// A file or directory could not be accessed.
    #[error("cache I/O failed for {path}: {message}")]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Operating system error.
        message: String,
    },
    /// A cached line could not be parsed.
    #[error("malformed cache line {line} in {path}: {message}")]
    Parse {
        /// File being read.
        path: Utf8PathBuf,
        /// One-based line number.
        line: usize,
        /// Description of the problem.
        message: String,
    },
}

/// Errors raised while building the cache.
#[derive(Debug, Error)]
pub enum InventoryError<E>
where
    E: std::error::Error + 'static,
{
    /// Writing the snapshot failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// Listing a project failed.
    #[error("failed to list project {project}: {source}")]
    Provider {
        /// Project being listed.
        project: String,
        /// Provider error.
        #[source]
        source: E,
    },
}

/// Private and floating addresses of a cached instance.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct AddressSummary {
    /// Private addresses.
    pub fixed: Vec<String>,
    /// Floating addresses.
    pub floating: Vec<String>,
}

impl AddressSummary {
    /// Collects the addresses of `instance`.
    #[must_use]
    pub fn of(instance: &Instance) -> Self {
        Self {
            fixed: instance
                .addresses_of(AddressKind::Fixed)
                .map(str::to_owned)
                .collect(),
            floating: instance
                .addresses_of(AddressKind::Floating)
                .map(str::to_owned)
                .collect(),
        }
    }
}

/// One instance read back from the cache.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceRecord {
    /// Instance identifier.
    pub id: String,
    /// Instance name; may contain spaces.
    pub name: String,
    /// Cached addresses.
    pub addresses: AddressSummary,
}

impl InstanceRecord {
    /// Renders `<id> <floating-or-[NO_PUBLIC_IPS]> <name>`.
    #[must_use]
    pub fn listing_line(&self) -> String {
        let floating = if self.addresses.floating.is_empty() {
            NO_PUBLIC_IPS.to_owned()
        } else {
            self.addresses.floating.join(",")
        };
        format!("{} {floating} {}", self.id, self.name)
    }
}

/// Everything cached for one project.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Snapshot {
    /// Instances of the project.
    pub instances: Vec<Instance>,
    /// Security groups of the project.
    pub security_groups: Vec<SecurityGroup>,
    /// Images visible to the project.
    pub images: Vec<Image>,
}

/// Renders the instance snapshot, one `<id> <name> <json>` line each.
///
/// # Errors
///
/// Returns [`CacheError::Parse`] if the addresses cannot be serialised.
pub fn render_instances(instances: &[Instance]) -> Result<String, CacheError> {
    let mut out = String::new();
    for (idx, instance) in instances.iter().enumerate() {
        let json = serde_json::to_string(&AddressSummary::of(instance)).map_err(|err| {
            CacheError::Parse {
                path: Utf8PathBuf::from(INSTANCES_PREFIX),
                line: idx + 1,
                message: err.to_string(),
            }
        })?;
        out.push_str(&format!("{} {} {json}\n", instance.id, instance.name));
    }
    Ok(out)
}

/// Renders `<name> <description>` lines, spaces in descriptions replaced by
/// underscores.
#[must_use]
pub fn render_security_groups(groups: &[SecurityGroup]) -> String {
    groups.iter().fold(String::new(), |mut out, group| {
        out.push_str(&format!("{} {}\n", group.name, group.description.replace(' ', "_")));
        out
    })
}

/// Renders `<id> <name>` lines, spaces in names replaced by underscores.
#[must_use]
pub fn render_images(images: &[Image]) -> String {
    images.iter().fold(String::new(), |mut out, image| {
        out.push_str(&format!("{} {}\n", image.id, image.name.replace(' ', "_")));
        out
    })
}

/// Parses one instance line.
///
/// # Errors
///
/// Returns the problem found as a message.
pub fn parse_instance_line(line: &str) -> Result<InstanceRecord, String> {
    let json_start = line
        .find('{')
        .ok_or_else(|| String::from("missing address object"))?;
    let (head, json) = line.split_at(json_start);
    let (id, name) = head
        .trim()
        .split_once(' ')
        .ok_or_else(|| String::from("expected '<id> <name>' before the addresses"))?;
    let addresses: AddressSummary =
        serde_json::from_str(json).map_err(|err| err.to_string())?;
    Ok(InstanceRecord {
        id: id.to_owned(),
        name: name.trim().to_owned(),
        addresses,
    })
}

/// Cache directory accessed through `cap-std`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CacheStore {
    root: Utf8PathBuf,
}

impl CacheStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the cache directory.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn io_error(&self, file: Option<&str>, err: &io::Error) -> CacheError {
        CacheError::Io {
            path: file.map_or_else(|| self.root.clone(), |name| self.root.join(name)),
            message: err.to_string(),
        }
    }

    fn open(&self, create: bool) -> Result<Dir, CacheError> {
        if create {
            Dir::create_ambient_dir_all(&self.root, ambient_authority())
                .map_err(|err| self.io_error(None, &err))?;
        }
        Dir::open_ambient_dir(&self.root, ambient_authority()).map_err(|err| self.io_error(None, &err))
    }

    /// Writes the three snapshot files of `project`, replacing old ones.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the directory or a file cannot be
    /// written.
    pub fn write_snapshot(&self, project: &str, snapshot: &Snapshot) -> Result<(), CacheError> {
        let dir = self.open(true)?;
        let files = [
            (
                format!("{INSTANCES_PREFIX}{project}"),
                render_instances(&snapshot.instances)?,
            ),
            (
                format!("{SECGROUPS_PREFIX}{project}"),
                render_security_groups(&snapshot.security_groups),
            ),
            (
                format!("{IMAGES_PREFIX}{project}"),
                render_images(&snapshot.images),
            ),
        ];
        for (name, contents) in files {
            dir.write(&name, contents)
                .map_err(|err| self.io_error(Some(&name), &err))?;
        }
        Ok(())
    }

    /// Reads the cached instances of `project`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the file is missing or malformed.
    pub fn read_instances(&self, project: &str) -> Result<Vec<InstanceRecord>, CacheError> {
        let name = format!("{INSTANCES_PREFIX}{project}");
        let dir = self.open(false)?;
        let contents = dir
            .read_to_string(&name)
            .map_err(|err| self.io_error(Some(&name), &err))?;
        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                parse_instance_line(line).map_err(|message| CacheError::Parse {
                    path: self.root.join(&name),
                    line: idx + 1,
                    message,
                })
            })
            .collect()
    }
}

/// Lists everything cached for one project.
///
/// # Errors
///
/// Returns the provider error of the first failing listing.
pub async fn snapshot<C: Cloud>(cloud: &C) -> Result<Snapshot, C::Error> {
    Ok(Snapshot {
        instances: cloud.list_servers().await?,
        security_groups: cloud.list_security_groups(None).await?,
        images: cloud.list_images().await?,
    })
}

/// Snapshots every project into `store`, connecting to each project with a
/// fresh client from `connect`.
///
/// # Errors
///
/// Returns [`InventoryError`] for the first project that fails.
pub async fn build_cache<C, F>(
    store: &CacheStore,
    projects: &[String],
    mut connect: F,
) -> Result<(), InventoryError<C::Error>>
where
    C: Cloud,
    F: FnMut(&str) -> C,
{
    for project in projects {
        info!(%project, root = %store.root(), "building cache");
        let cloud = connect(project);
        let snap = snapshot(&cloud)
            .await
            .map_err(|source| InventoryError::Provider {
                project: project.clone(),
                source,
            })?;
        store.write_snapshot(project, &snap)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;
    use crate::cloud::{InstanceAddress, InstanceStatus};
    use crate::test_support::{FakeCloud, instance, security_group};

    fn temp_store() -> (TempDir, CacheStore) {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().join("os_cache"))
            .unwrap_or_else(|path| panic!("non-utf8 temp path: {}", path.display()));
        (tmp, CacheStore::new(root))
    }

    #[rstest]
    fn instance_lines_keep_names_with_spaces() {
        let record = parse_instance_line(
            r#"abc web server {"fixed": ["10.0.0.4"], "floating": ["198.51.100.4"]}"#,
        )
        .expect("line parses");
        assert_eq!(record.id, "abc");
        assert_eq!(record.name, "web server");
        assert_eq!(record.listing_line(), "abc 198.51.100.4 web server");
    }

    #[rstest]
    fn instances_without_floating_addresses_are_flagged() {
        let record = parse_instance_line(r#"abc db {"fixed": [], "floating": []}"#)
            .expect("line parses");
        assert_eq!(record.listing_line(), "abc [NO_PUBLIC_IPS] db");
    }

    #[rstest]
    #[case("abc db")]
    #[case(r#"abc {"fixed": [], "floating": []}"#)]
    #[case("abc db {not json}")]
    fn malformed_lines_are_rejected(#[case] line: &str) {
        assert!(parse_instance_line(line).is_err());
    }

    #[rstest]
    fn descriptions_and_image_names_replace_spaces() {
        let mut group = security_group("sg-1", "web");
        group.description = String::from("public web access");
        assert_eq!(render_security_groups(&[group]), "web public_web_access\n");
        assert_eq!(
            render_images(&[Image {
                id: String::from("img"),
                name: String::from("Ubuntu 22.04"),
            }]),
            "img Ubuntu_22.04\n"
        );
    }

    #[tokio::test]
    async fn build_then_read_round_trips_instances() {
        let (_tmp, store) = temp_store();
        let mut vm = instance("vm-1", "web 1", InstanceStatus::Active, &["10.0.0.4"]);
        if let Some(list) = vm.addresses.get_mut("private") {
            list.push(InstanceAddress::floating("198.51.100.4"));
        }
        let mut connected = Vec::new();

        build_cache(&store, &[String::from("alpha")], |project| {
            connected.push(project.to_owned());
            let cloud = FakeCloud::new();
            cloud.add_server(vm.clone());
            cloud.add_image("img-1", "debian 12");
            cloud
        })
        .await
        .expect("cache written");

        assert_eq!(connected, vec![String::from("alpha")]);
        let records = store.read_instances("alpha").expect("cache readable");
        assert_eq!(records.len(), 1);
        assert_eq!(
            records.first().map(InstanceRecord::listing_line),
            Some(String::from("vm-1 198.51.100.4 web 1"))
        );
        let images = std::fs::read_to_string(store.root().join("images_alpha"))
            .expect("images file written");
        assert_eq!(images, "img-1 debian_12\n");
    }

    #[rstest]
    fn missing_cache_is_an_io_error() {
        let (_tmp, store) = temp_store();
        assert!(matches!(
            store.read_instances("nobody"),
            Err(CacheError::Io { .. })
        ));
    }
}
