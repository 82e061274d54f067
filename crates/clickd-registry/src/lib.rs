use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Pseudo-user key under which packages installed for every user are
/// registered.
pub const ALL_USERS: &str = "@all";

/// Literal symlink target marking a package as hidden from a key without
/// touching the layer that physically owns it.
const HIDDEN_TARGET: &str = "@hidden";

const USERS_SUBDIR: &str = ".click/users";

/// The vantage point a visibility query is answered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Viewpoint<'a> {
    AllUsers,
    User(&'a str),
}

impl Viewpoint<'_> {
    pub fn key(&self) -> &str {
        match self {
            Viewpoint::AllUsers => ALL_USERS,
            Viewpoint::User(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Registration {
    Hidden,
    Version(String),
}

/// One package database rooted at a directory. Physical package data lives
/// in `<root>/<package>/<version>/`; per-key registrations are symlinks at
/// `<root>/.click/users/<key>/<package>` pointing at a version directory,
/// or at the literal `@hidden` marker.
#[derive(Debug, Clone)]
pub struct RegistryLayer {
    root: PathBuf,
}

impl RegistryLayer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn package_dir(&self, package: &str) -> PathBuf {
        self.root.join(package)
    }

    pub fn version_dir(&self, package: &str, version: &str) -> PathBuf {
        self.root.join(package).join(version)
    }

    pub fn users_dir(&self) -> PathBuf {
        self.root.join(USERS_SUBDIR)
    }

    pub fn registration_path(&self, key: &str, package: &str) -> PathBuf {
        self.users_dir().join(key).join(package)
    }

    /// True only if this layer physically holds exactly this
    /// (package, version) pair, as opposed to merely making it visible.
    pub fn has_package_version(&self, package: &str, version: &str) -> bool {
        self.version_dir(package, version).is_dir()
    }

    fn registration(&self, key: &str, package: &str) -> Option<Registration> {
        let link = self.registration_path(key, package);
        let target = fs::read_link(&link).ok()?;
        if target.as_os_str() == HIDDEN_TARGET {
            return Some(Registration::Hidden);
        }
        let version = target.file_name()?.to_str()?.to_string();
        Some(Registration::Version(version))
    }
}

/// A priority-ordered stack of registry layers. Lowest index is lowest
/// priority; the last layer is the writable overlay, the only layer
/// mutations ever touch.
#[derive(Debug, Clone)]
pub struct RegistryStack {
    layers: Vec<RegistryLayer>,
}

impl RegistryStack {
    /// Reads the base registry root and appends each extra root with
    /// increasing priority. Any root that is not a readable directory
    /// fails the load.
    pub fn load(base_root: &Path, extra_roots: &[PathBuf]) -> Result<Self> {
        if !base_root.is_dir() {
            bail!(
                "registry base root is not a directory: {}",
                base_root.display()
            );
        }

        let mut layers = vec![RegistryLayer::new(base_root)];
        for root in extra_roots {
            if !root.is_dir() {
                bail!("extra registry root is not a directory: {}", root.display());
            }
            layers.push(RegistryLayer::new(root));
        }

        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[RegistryLayer] {
        &self.layers
    }

    /// The highest-priority, writable layer. `load` always produces at
    /// least the base layer, so this is only `None` for a hand-built
    /// empty stack.
    pub fn overlay(&self) -> Option<&RegistryLayer> {
        self.layers.last()
    }

    fn find_registration(&self, key: &str, package: &str) -> Option<Registration> {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| layer.registration(key, package))
    }

    /// The version visible from a viewpoint: the first registration
    /// scanning from the highest-priority layer down, with `@hidden`
    /// masking everything below it. A user viewpoint with no registration
    /// of its own inherits the `@all` registration.
    pub fn installed_version(&self, package: &str, viewpoint: Viewpoint<'_>) -> Option<String> {
        let own = self.find_registration(viewpoint.key(), package);
        let effective = match viewpoint {
            Viewpoint::AllUsers => own,
            Viewpoint::User(_) => own.or_else(|| self.find_registration(ALL_USERS, package)),
        };
        match effective {
            Some(Registration::Version(version)) => Some(version),
            Some(Registration::Hidden) | None => None,
        }
    }

    /// Drops a viewpoint's registration. When the overlay holds the key's
    /// own link it is unlinked; when the registration is inherited from a
    /// lower layer (or from `@all`) an `@hidden` link is written in the
    /// overlay instead, so the underlying layer's files stay untouched.
    pub fn remove_registration(&self, viewpoint: Viewpoint<'_>, package: &str) -> Result<()> {
        let key = viewpoint.key();
        if self.installed_version(package, viewpoint).is_none() {
            bail!("package '{package}' is not registered for {key}");
        }

        let overlay = self
            .overlay()
            .context("registry stack has no overlay layer")?;
        let link = overlay.registration_path(key, package);
        match fs::symlink_metadata(&link) {
            Ok(_) => fs::remove_file(&link)
                .with_context(|| format!("failed to unlink registration: {}", link.display())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let parent = link
                    .parent()
                    .context("registration path has no parent directory")?;
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create registration dir: {}", parent.display())
                })?;
                std::os::unix::fs::symlink(HIDDEN_TARGET, &link).with_context(|| {
                    format!("failed to write hidden registration: {}", link.display())
                })
            }
            Err(err) => Err(err).with_context(|| {
                format!("failed to inspect registration: {}", link.display())
            }),
        }
    }

    /// Garbage-collects the physical package data once nothing references
    /// it: when no registration in any layer still points at
    /// `package`/`version`, the overlay's version directory is removed,
    /// and then the now-empty top-level package directory. No-op while a
    /// reference remains.
    pub fn maybe_remove(&self, package: &str, version: &str) -> Result<()> {
        if self.version_referenced(package, version)? {
            return Ok(());
        }

        let overlay = self
            .overlay()
            .context("registry stack has no overlay layer")?;
        let version_dir = overlay.version_dir(package, version);
        if version_dir.is_dir() {
            fs::remove_dir_all(&version_dir).with_context(|| {
                format!("failed to remove package data: {}", version_dir.display())
            })?;
        }

        let package_dir = overlay.package_dir(package);
        if directory_is_empty(&package_dir)? {
            fs::remove_dir(&package_dir).with_context(|| {
                format!(
                    "failed to remove empty package entry: {}",
                    package_dir.display()
                )
            })?;
        }
        Ok(())
    }

    fn version_referenced(&self, package: &str, version: &str) -> Result<bool> {
        for layer in &self.layers {
            let users_dir = layer.users_dir();
            let entries = match fs::read_dir(&users_dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to read users dir: {}", users_dir.display())
                    });
                }
            };
            for entry in entries {
                let entry = entry?;
                let Some(key) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if layer.registration(&key, package)
                    == Some(Registration::Version(version.to_string()))
                {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

fn directory_is_empty(dir: &Path) -> Result<bool> {
    let mut entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read package entry: {}", dir.display()));
        }
    };
    Ok(entries.next().is_none())
}
