use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs_err as fs;
use tracing::debug;

/// Cache name of the private key for `domain`.
pub fn key_name(domain: &str) -> String {
    format!("{domain}.key")
}

/// Cache name of the certificate chain for `domain`.
pub fn cert_name(domain: &str) -> String {
    format!("{domain}.cert")
}

/// Cache name of the TLS-ALPN-01 validation key for `domain`.
pub(crate) fn challenge_key_name(domain: &str) -> String {
    format!("{domain}.challenge.key")
}

/// Cache name of the TLS-ALPN-01 validation certificate for `domain`.
pub(crate) fn challenge_cert_name(domain: &str) -> String {
    format!("{domain}.challenge.cert")
}

/// On-disk store for PEM-encoded keys and certificates, addressed by name.
///
/// Writes land under a temporary name in the same directory and are renamed
/// into place, so a concurrent reader observes either the previous content
/// or the new content, never a partial write.
#[derive(Debug, Clone)]
pub struct CertCache {
    dir: PathBuf,
}

impl CertCache {
    /// Open the cache at `dir`, creating the directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("failed to create cache directory")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
                .context("failed to set cache directory permissions")?;
        }
        Ok(Self { dir })
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn read(&self, name: &str) -> Result<String> {
        fs::read_to_string(self.path(name)).context("failed to read cache entry")
    }

    /// Atomically replace the content of `name`.
    pub fn write(&self, name: &str, bytes: impl AsRef<[u8]>) -> Result<()> {
        let tmp = self.dir.join(format!(".{name}.tmp"));
        fs::write(&tmp, bytes.as_ref()).context("failed to write cache entry")?;
        #[cfg(unix)]
        if name.ends_with(".key") {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .context("failed to set key permissions")?;
        }
        fs::rename(&tmp, self.path(name)).context("failed to install cache entry")?;
        debug!("wrote cache entry: {name}");
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        fs::remove_file(self.path(name)).context("failed to remove cache entry")
    }

    /// Install a domain's key and certificate.
    ///
    /// The key is installed before the certificate, so `<domain>.cert` never
    /// names a chain whose key is not already in place.
    pub fn write_bundle(&self, domain: &str, key_pem: &str, cert_pem: &str) -> Result<()> {
        self.write(&key_name(domain), key_pem)?;
        self.write(&cert_name(domain), cert_pem)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, CertCache) {
        let dir = TempDir::new().unwrap();
        let cache = CertCache::new(dir.path()).unwrap();
        (dir, cache)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, cache) = setup();
        assert!(!cache.exists("example.com.cert"));
        cache.write("example.com.cert", "pem data").unwrap();
        assert!(cache.exists("example.com.cert"));
        assert_eq!(cache.read("example.com.cert").unwrap(), "pem data");
    }

    #[test]
    fn write_replaces_existing_content() {
        let (_dir, cache) = setup();
        cache.write("a.cert", "old").unwrap();
        cache.write("a.cert", "new").unwrap();
        assert_eq!(cache.read("a.cert").unwrap(), "new");
    }

    #[test]
    fn write_leaves_no_temporary_files() {
        let (dir, cache) = setup();
        cache.write("a.key", "key").unwrap();
        cache.write("a.cert", "cert").unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")), "{names:?}");
    }

    #[test]
    fn bundle_names_follow_convention() {
        let (_dir, cache) = setup();
        cache.write_bundle("example.com", "key pem", "cert pem").unwrap();
        assert_eq!(cache.read("example.com.key").unwrap(), "key pem");
        assert_eq!(cache.read("example.com.cert").unwrap(), "cert pem");
    }

    #[test]
    fn remove_deletes_the_entry() {
        let (_dir, cache) = setup();
        cache.write("gone.cert", "x").unwrap();
        cache.remove("gone.cert").unwrap();
        assert!(!cache.exists("gone.cert"));
    }

    #[cfg(unix)]
    #[test]
    fn key_files_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, cache) = setup();
        cache.write("example.com.key", "secret").unwrap();
        let mode = std::fs::metadata(cache.path("example.com.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
