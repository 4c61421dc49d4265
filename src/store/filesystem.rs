//! Filesystem-backed Certificate Store (`spec.md` §4.1).
//!
//! Layout: `<pkiRoot>/pki/<groupTag>/{trusted/certs,trusted/crl,
//! issuer/certs,issuer/crl,rejected/certs,own/certs,own/private}`.
//! Directories are created on first use with mode `0777` (subject to
//! umask), matching `examples/original_source/plugins/crypto/certstore/ua_certstore_file.c`'s
//! `mkpath`. Sub-directory listings are flat; "listing the directory
//! IS the index" (`spec.md` §6) — no side index file is kept.

use super::{dedup_certs, dedup_crls, memory::MemoryCertificateStore, CertificateStore};
use crate::error::{GdsError, Result};
use crate::types::{Certificate, Crl, GroupId, PrivateKey, TrustList, TrustListMask};
use async_trait::async_trait;
use rand::Rng;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Filesystem-backed certificate store for one group.
pub struct FilesystemCertificateStore {
    root: PathBuf,
    max_rejected_list_size: usize,
}

impl FilesystemCertificateStore {
    /// Open (creating if absent) the store for `group` under `pki_root`.
    pub async fn open(
        pki_root: &Path,
        group: &GroupId,
        max_rejected_list_size: usize,
    ) -> Result<Self> {
        let root = pki_root.join("pki").join(group.tag());
        let store = Self {
            root,
            max_rejected_list_size,
        };
        store.ensure_layout().await?;
        Ok(store)
    }

    fn dir(&self, sub: &str) -> PathBuf {
        self.root.join(sub)
    }

    async fn ensure_layout(&self) -> Result<()> {
        for sub in [
            "trusted/certs",
            "trusted/crl",
            "issuer/certs",
            "issuer/crl",
            "rejected/certs",
            "own/certs",
            "own/private",
        ] {
            create_dir_0777(&self.dir(sub)).await?;
        }
        Ok(())
    }

    async fn read_all(&self, sub: &str, ext: &str) -> Result<Vec<(PathBuf, Vec<u8>)>> {
        let dir = self.dir(sub);
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(GdsError::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(GdsError::Io)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ext) {
                continue;
            }
            let data = fs::read(&path).await.map_err(GdsError::Io)?;
            out.push((path, data));
        }
        Ok(out)
    }

    async fn replace_dir(&self, sub: &str, ext: &str, items: &[Vec<u8>], stems: &[String]) -> Result<()> {
        let dir = self.dir(sub);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                create_dir_0777(&dir).await?;
                fs::read_dir(&dir).await.map_err(GdsError::Io)?
            }
            Err(e) => return Err(GdsError::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(GdsError::Io)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ext) {
                fs::remove_file(&path).await.map_err(GdsError::Io)?;
            }
        }
        for (data, stem) in items.iter().zip(stems.iter()) {
            let path = dir.join(format!("{stem}.{ext}"));
            fs::write(&path, data).await.map_err(GdsError::Io)?;
        }
        Ok(())
    }

    async fn union_dir(&self, sub: &str, ext: &str, items: &[Vec<u8>], stems: &[String]) -> Result<()> {
        let existing = self.read_all(sub, ext).await?;
        let dir = self.dir(sub);
        for (data, stem) in items.iter().zip(stems.iter()) {
            if existing.iter().any(|(_, d)| d == data) {
                continue; // already present by byte equality
            }
            let path = dir.join(format!("{stem}.{ext}"));
            fs::write(&path, data).await.map_err(GdsError::Io)?;
        }
        Ok(())
    }

    async fn subtract_dir(&self, sub: &str, ext: &str, items: &[Vec<u8>]) -> Result<()> {
        for (path, data) in self.read_all(sub, ext).await? {
            if items.iter().any(|i| i == &data) {
                fs::remove_file(&path).await.map_err(GdsError::Io)?;
            }
        }
        Ok(())
    }
}

fn file_stem(cert: &Certificate) -> String {
    let thumb = cert.thumbprint();
    let cn = common_name(cert).unwrap_or_else(|| "cert".to_string());
    format!("{}[{}]", sanitize(&cn), thumb.0)
}

fn crl_stem(crl: &Crl) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, crl.as_bytes());
    format!("crl[{}]", hex::encode_upper(digest.as_ref()))
}

fn common_name(cert: &Certificate) -> Option<String> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_bytes()).ok()?;
    let name = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string());
    name
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(unix)]
async fn create_dir_0777(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::create_dir_all(path).await.map_err(GdsError::Io)?;
    let perms = std::fs::Permissions::from_mode(0o777);
    fs::set_permissions(path, perms).await.map_err(GdsError::Io)?;
    Ok(())
}

#[cfg(not(unix))]
async fn create_dir_0777(path: &Path) -> Result<()> {
    fs::create_dir_all(path).await.map_err(GdsError::Io)
}

#[async_trait]
impl CertificateStore for FilesystemCertificateStore {
    async fn get_trust_list(&self, mask: TrustListMask) -> Result<TrustList> {
        let trusted_certificates = if mask.contains(TrustListMask::TRUSTED_CERTIFICATES) {
            self.read_all("trusted/certs", "der")
                .await?
                .into_iter()
                .map(|(_, d)| Certificate::new(d))
                .collect()
        } else {
            Vec::new()
        };
        let trusted_crls = if mask.contains(TrustListMask::TRUSTED_CRLS) {
            self.read_all("trusted/crl", "der")
                .await?
                .into_iter()
                .map(|(_, d)| Crl::new(d))
                .collect()
        } else {
            Vec::new()
        };
        let issuer_certificates = if mask.contains(TrustListMask::ISSUER_CERTIFICATES) {
            self.read_all("issuer/certs", "der")
                .await?
                .into_iter()
                .map(|(_, d)| Certificate::new(d))
                .collect()
        } else {
            Vec::new()
        };
        let issuer_crls = if mask.contains(TrustListMask::ISSUER_CRLS) {
            self.read_all("issuer/crl", "der")
                .await?
                .into_iter()
                .map(|(_, d)| Crl::new(d))
                .collect()
        } else {
            Vec::new()
        };
        Ok(TrustList {
            specified_lists: Some(mask),
            trusted_certificates,
            trusted_crls,
            issuer_certificates,
            issuer_crls,
        })
    }

    async fn set_trust_list(&self, tl: &TrustList) -> Result<()> {
        let mask = tl.mask();
        if mask.contains(TrustListMask::TRUSTED_CERTIFICATES) {
            let certs = dedup_certs(&tl.trusted_certificates);
            let stems: Vec<String> = certs.iter().map(file_stem).collect();
            let bytes: Vec<Vec<u8>> = certs.iter().map(|c| c.0.clone()).collect();
            self.replace_dir("trusted/certs", "der", &bytes, &stems).await?;
        }
        if mask.contains(TrustListMask::TRUSTED_CRLS) {
            let crls = dedup_crls(&tl.trusted_crls);
            let stems: Vec<String> = crls.iter().map(crl_stem).collect();
            let bytes: Vec<Vec<u8>> = crls.iter().map(|c| c.0.clone()).collect();
            self.replace_dir("trusted/crl", "der", &bytes, &stems).await?;
        }
        if mask.contains(TrustListMask::ISSUER_CERTIFICATES) {
            let certs = dedup_certs(&tl.issuer_certificates);
            let stems: Vec<String> = certs.iter().map(file_stem).collect();
            let bytes: Vec<Vec<u8>> = certs.iter().map(|c| c.0.clone()).collect();
            self.replace_dir("issuer/certs", "der", &bytes, &stems).await?;
        }
        if mask.contains(TrustListMask::ISSUER_CRLS) {
            let crls = dedup_crls(&tl.issuer_crls);
            let stems: Vec<String> = crls.iter().map(crl_stem).collect();
            let bytes: Vec<Vec<u8>> = crls.iter().map(|c| c.0.clone()).collect();
            self.replace_dir("issuer/crl", "der", &bytes, &stems).await?;
        }
        info!(root = %self.root.display(), "trust list replaced");
        Ok(())
    }

    async fn add_to_trust_list(&self, tl: &TrustList) -> Result<()> {
        let mask = tl.mask();
        if mask.contains(TrustListMask::TRUSTED_CERTIFICATES) {
            let stems: Vec<String> = tl.trusted_certificates.iter().map(file_stem).collect();
            let bytes: Vec<Vec<u8>> = tl.trusted_certificates.iter().map(|c| c.0.clone()).collect();
            self.union_dir("trusted/certs", "der", &bytes, &stems).await?;
        }
        if mask.contains(TrustListMask::TRUSTED_CRLS) {
            let stems: Vec<String> = tl.trusted_crls.iter().map(crl_stem).collect();
            let bytes: Vec<Vec<u8>> = tl.trusted_crls.iter().map(|c| c.0.clone()).collect();
            self.union_dir("trusted/crl", "der", &bytes, &stems).await?;
        }
        if mask.contains(TrustListMask::ISSUER_CERTIFICATES) {
            let stems: Vec<String> = tl.issuer_certificates.iter().map(file_stem).collect();
            let bytes: Vec<Vec<u8>> = tl.issuer_certificates.iter().map(|c| c.0.clone()).collect();
            self.union_dir("issuer/certs", "der", &bytes, &stems).await?;
        }
        if mask.contains(TrustListMask::ISSUER_CRLS) {
            let stems: Vec<String> = tl.issuer_crls.iter().map(crl_stem).collect();
            let bytes: Vec<Vec<u8>> = tl.issuer_crls.iter().map(|c| c.0.clone()).collect();
            self.union_dir("issuer/crl", "der", &bytes, &stems).await?;
        }
        Ok(())
    }

    async fn remove_from_trust_list(&self, tl: &TrustList) -> Result<()> {
        let mask = tl.mask();
        if mask.contains(TrustListMask::TRUSTED_CERTIFICATES) {
            let bytes: Vec<Vec<u8>> = tl.trusted_certificates.iter().map(|c| c.0.clone()).collect();
            self.subtract_dir("trusted/certs", "der", &bytes).await?;
        }
        if mask.contains(TrustListMask::TRUSTED_CRLS) {
            let bytes: Vec<Vec<u8>> = tl.trusted_crls.iter().map(|c| c.0.clone()).collect();
            self.subtract_dir("trusted/crl", "der", &bytes).await?;
        }
        if mask.contains(TrustListMask::ISSUER_CERTIFICATES) {
            let bytes: Vec<Vec<u8>> = tl.issuer_certificates.iter().map(|c| c.0.clone()).collect();
            self.subtract_dir("issuer/certs", "der", &bytes).await?;
        }
        if mask.contains(TrustListMask::ISSUER_CRLS) {
            let bytes: Vec<Vec<u8>> = tl.issuer_crls.iter().map(|c| c.0.clone()).collect();
            self.subtract_dir("issuer/crl", "der", &bytes).await?;
        }
        Ok(())
    }

    async fn get_rejected_list(&self) -> Result<Vec<Certificate>> {
        Ok(self
            .read_all("rejected/certs", "der")
            .await?
            .into_iter()
            .map(|(_, d)| Certificate::new(d))
            .collect())
    }

    async fn add_to_rejected_list(&self, cert: Certificate) -> Result<()> {
        let mut entries = self.read_all("rejected/certs", "der").await?;
        if entries.iter().any(|(_, d)| *d == cert.0) {
            return Ok(());
        }
        if self.max_rejected_list_size > 0 && entries.len() >= self.max_rejected_list_size {
            // evict oldest by mtime
            entries.sort_by_key(|(path, _)| {
                std::fs::metadata(path)
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
            });
            if let Some((oldest, _)) = entries.first() {
                fs::remove_file(oldest).await.map_err(GdsError::Io)?;
                debug!(path = %oldest.display(), "evicted oldest rejected certificate");
            }
        }
        let prefix: String = {
            let mut rng = rand::thread_rng();
            (0..40)
                .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
                .collect::<String>()
                .to_uppercase()
        };
        let path = self.dir("rejected/certs").join(format!("{prefix}.der"));
        fs::write(&path, &cert.0).await.map_err(GdsError::Io)?;
        warn!(path = %path.display(), "certificate added to rejected list");
        Ok(())
    }

    async fn write_identity(
        &self,
        old_cert: Option<&Certificate>,
        new_cert: &Certificate,
        new_key: &PrivateKey,
    ) -> Result<()> {
        let current = self.own_certificate().await?;
        if let (Some(old), Some(current)) = (old_cert, &current) {
            if old != current {
                return Err(GdsError::NotFound(
                    "old_cert does not match the currently stored identity".to_string(),
                ));
            }
        }

        // Remove the previous cert/key pair so exactly one identity remains.
        for sub in ["own/certs", "own/private"] {
            let dir = self.dir(sub);
            if let Ok(mut entries) = fs::read_dir(&dir).await {
                while let Some(entry) = entries.next_entry().await.map_err(GdsError::Io)? {
                    fs::remove_file(entry.path()).await.map_err(GdsError::Io)?;
                }
            }
        }

        let stem = file_stem(new_cert);
        fs::write(self.dir("own/certs").join(format!("{stem}.der")), &new_cert.0)
            .await
            .map_err(GdsError::Io)?;

        if !new_key.is_empty() {
            fs::write(
                self.dir("own/private").join(format!("{stem}.key")),
                new_key.expose_secret(),
            )
            .await
            .map_err(GdsError::Io)?;
        } else if let Some(old_key) = self.own_private_key().await? {
            fs::write(
                self.dir("own/private").join(format!("{stem}.key")),
                old_key.expose_secret(),
            )
            .await
            .map_err(GdsError::Io)?;
        }

        info!(stem = %stem, "own identity updated");
        Ok(())
    }

    async fn own_certificate(&self) -> Result<Option<Certificate>> {
        let entries = self.read_all("own/certs", "der").await?;
        Ok(entries.into_iter().next().map(|(_, d)| Certificate::new(d)))
    }

    async fn own_private_key(&self) -> Result<Option<PrivateKey>> {
        let entries = self.read_all("own/private", "key").await?;
        Ok(entries.into_iter().next().map(|(_, d)| PrivateKey::new(d)))
    }

    async fn snapshot_clone(&self) -> Result<MemoryCertificateStore> {
        let clone = MemoryCertificateStore::new(self.max_rejected_list_size);
        let tl = self.get_trust_list(TrustListMask::ALL).await?;
        clone.set_trust_list(&tl).await?;
        for cert in self.get_rejected_list().await? {
            clone.add_to_rejected_list(cert).await?;
        }
        if let Some(cert) = self.own_certificate().await? {
            let key = self
                .own_private_key()
                .await?
                .unwrap_or_else(|| PrivateKey::new(Vec::new()));
            clone.write_identity(None, &cert, &key).await?;
        }
        Ok(clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(byte: u8) -> Certificate {
        Certificate::new(vec![byte; 16])
    }

    #[tokio::test]
    async fn creates_seven_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let _store = FilesystemCertificateStore::open(dir.path(), &GroupId::Application, 0)
            .await
            .unwrap();
        let root = dir.path().join("pki").join("ApplCerts");
        for sub in [
            "trusted/certs",
            "trusted/crl",
            "issuer/certs",
            "issuer/crl",
            "rejected/certs",
            "own/certs",
            "own/private",
        ] {
            assert!(root.join(sub).is_dir(), "missing {sub}");
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemCertificateStore::open(dir.path(), &GroupId::Application, 0)
            .await
            .unwrap();
        let tl = TrustList {
            specified_lists: Some(TrustListMask::TRUSTED_CERTIFICATES),
            trusted_certificates: vec![cert(1), cert(2)],
            ..TrustList::empty()
        };
        store.set_trust_list(&tl).await.unwrap();
        let got = store
            .get_trust_list(TrustListMask::TRUSTED_CERTIFICATES)
            .await
            .unwrap();
        assert_eq!(got.trusted_certificates.len(), 2);
    }

    #[tokio::test]
    async fn add_to_trust_list_skips_byte_equal_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemCertificateStore::open(dir.path(), &GroupId::Application, 0)
            .await
            .unwrap();
        let tl = TrustList {
            specified_lists: Some(TrustListMask::TRUSTED_CERTIFICATES),
            trusted_certificates: vec![cert(1)],
            ..TrustList::empty()
        };
        store.add_to_trust_list(&tl).await.unwrap();
        store.add_to_trust_list(&tl).await.unwrap();
        let got = store
            .get_trust_list(TrustListMask::TRUSTED_CERTIFICATES)
            .await
            .unwrap();
        assert_eq!(got.trusted_certificates.len(), 1);
    }

    #[tokio::test]
    async fn rejected_list_bound_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemCertificateStore::open(dir.path(), &GroupId::Application, 2)
            .await
            .unwrap();
        store.add_to_rejected_list(cert(1)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        store.add_to_rejected_list(cert(2)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        store.add_to_rejected_list(cert(3)).await.unwrap();
        let rejected = store.get_rejected_list().await.unwrap();
        assert_eq!(rejected.len(), 2);
        assert!(!rejected.contains(&cert(1)));
    }

    #[tokio::test]
    async fn write_identity_reuses_key_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemCertificateStore::open(dir.path(), &GroupId::Application, 0)
            .await
            .unwrap();
        store
            .write_identity(None, &cert(1), &PrivateKey::new(vec![7, 7, 7]))
            .await
            .unwrap();
        store
            .write_identity(Some(&cert(1)), &cert(2), &PrivateKey::new(vec![]))
            .await
            .unwrap();
        let key = store.own_private_key().await.unwrap().unwrap();
        assert_eq!(key.expose_secret(), &[7, 7, 7]);
        assert_eq!(store.own_certificate().await.unwrap().unwrap(), cert(2));
    }
}
