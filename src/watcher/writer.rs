//! Atomic publication of certificate/key pairs.
//!
//! Every rotation is written to its own hidden generation directory and published by swapping a
//! single `..data` symlink:
//!
//! ```text
//! <dir>/..gen-<nanos>-<generation>/tls.crt
//! <dir>/..gen-<nanos>-<generation>/tls.key
//! <dir>/..data    -> ..gen-<nanos>-<generation>
//! <dir>/tls.crt   -> ..data/tls.crt
//! <dir>/tls.key   -> ..data/tls.key
//! ```
//!
//! The swap is a `rename(2)`, so `tls.crt` and `tls.key` always resolve into the same generation.

use crate::constants::{
    CERT_FILE_MODE, CERT_FILE_NAME, DATA_DIR_LINK, GENERATION_DIR_PREFIX, KEY_FILE_MODE,
    KEY_FILE_NAME,
};
use crate::credential::Credential;
use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{symlink, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const TMP_SUFFIX: &str = ".tmp";
const READ_ATTEMPTS: usize = 8;

/// Writes credential pairs into a directory.
#[derive(Debug, Clone)]
pub(crate) struct PairWriter {
    dir: PathBuf,
}

/// Failure of one publication step.
#[derive(Debug)]
pub(crate) struct WriteFailure {
    pub(crate) path: PathBuf,
    pub(crate) source: io::Error,
}

trait Context<T> {
    fn at(self, path: &Path) -> Result<T, WriteFailure>;
}

impl<T> Context<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T, WriteFailure> {
        self.map_err(|source| WriteFailure {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl PairWriter {
    pub(crate) fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /// Encodes `credential` as PEM and publishes it as generation `generation`.
    pub(crate) async fn publish(
        &self,
        credential: &Credential,
        generation: u64,
    ) -> Result<(), WriteFailure> {
        let cert = credential.cert_chain_pem();
        let key = credential.private_key_pem();
        let writer = self.clone();

        tokio::task::spawn_blocking(move || {
            writer.write_generation(cert.as_bytes(), key.as_bytes(), generation)
        })
        .await
        .map_err(|e| WriteFailure {
            path: self.dir.clone(),
            source: io::Error::other(e),
        })?
    }

    pub(crate) fn write_generation(
        &self,
        cert: &[u8],
        key: &[u8],
        generation: u64,
    ) -> Result<(), WriteFailure> {
        fs::create_dir_all(&self.dir).at(&self.dir)?;

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let gen_name = format!("{GENERATION_DIR_PREFIX}{nanos}-{generation}");
        let gen_dir = self.dir.join(&gen_name);

        fs::create_dir(&gen_dir).at(&gen_dir)?;
        write_file(&gen_dir.join(CERT_FILE_NAME), cert, CERT_FILE_MODE)?;
        write_file(&gen_dir.join(KEY_FILE_NAME), key, KEY_FILE_MODE)?;
        sync_dir(&gen_dir)?;

        replace_symlink(&self.dir, DATA_DIR_LINK, Path::new(&gen_name))?;
        for name in [CERT_FILE_NAME, KEY_FILE_NAME] {
            ensure_link(&self.dir, name)?;
        }
        sync_dir(&self.dir)?;

        debug!("published {} in {}", gen_name, self.dir.display());
        self.remove_stale_generations(&gen_name);
        Ok(())
    }

    fn remove_stale_generations(&self, current: &str) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("failed to list {}: {e}", self.dir.display());
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(GENERATION_DIR_PREFIX) || name == current {
                continue;
            }
            if let Err(e) = fs::remove_dir_all(entry.path()) {
                warn!("failed to remove stale generation {name}: {e}");
            }
        }
    }
}

/// Reads the published certificate and key as one consistent pair.
///
/// Both files are opened through the generation the `..data` link designates at the time of the
/// call, so a concurrent rotation cannot mix two generations. Returns `Ok(None)` while nothing
/// has been published.
pub fn read_pair(dir: &Path) -> io::Result<Option<(Vec<u8>, Vec<u8>)>> {
    let link = dir.join(DATA_DIR_LINK);

    for _ in 0..READ_ATTEMPTS {
        let target = match fs::read_link(&link) {
            Ok(target) => dir.join(target),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        // A rotation may remove the generation between resolving the link and opening.
        let opened = File::open(target.join(CERT_FILE_NAME))
            .and_then(|cert| Ok((cert, File::open(target.join(KEY_FILE_NAME))?)));
        let (mut cert_file, mut key_file) = match opened {
            Ok(files) => files,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };

        let mut cert = Vec::new();
        let mut key = Vec::new();
        cert_file.read_to_end(&mut cert)?;
        key_file.read_to_end(&mut key)?;
        return Ok(Some((cert, key)));
    }

    Err(io::Error::new(
        io::ErrorKind::Interrupted,
        format!("{} kept changing while reading", link.display()),
    ))
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), WriteFailure> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
        .at(path)?;
    // The umask may have narrowed the creation mode.
    file.set_permissions(fs::Permissions::from_mode(mode))
        .at(path)?;
    file.write_all(contents).at(path)?;
    file.sync_all().at(path)
}

fn sync_dir(dir: &Path) -> Result<(), WriteFailure> {
    File::open(dir).and_then(|d| d.sync_all()).at(dir)
}

/// Points `dir/name` at `target` with a rename, replacing whatever was there.
fn replace_symlink(dir: &Path, name: &str, target: &Path) -> Result<(), WriteFailure> {
    let tmp = dir.join(format!("{name}{TMP_SUFFIX}"));
    match fs::remove_file(&tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(WriteFailure { path: tmp, source: e }),
    }
    symlink(target, &tmp).at(&tmp)?;

    let path = dir.join(name);
    fs::rename(&tmp, &path).at(&path)
}

/// Makes `dir/name` a symlink into `..data`, migrating a regular file left by an older layout.
fn ensure_link(dir: &Path, name: &str) -> Result<(), WriteFailure> {
    let path = dir.join(name);
    let target = Path::new(DATA_DIR_LINK).join(name);

    match fs::read_link(&path) {
        Ok(current) if current == target => Ok(()),
        Ok(_) => replace_symlink(dir, name, &target),
        // EINVAL: a regular file.
        Err(e) if e.kind() == io::ErrorKind::NotFound || e.kind() == io::ErrorKind::InvalidInput => {
            if e.kind() == io::ErrorKind::InvalidInput {
                debug!("migrating {} to a symlink", path.display());
            }
            replace_symlink(dir, name, &target)
        }
        Err(e) => Err(WriteFailure { path, source: e }),
    }
}
