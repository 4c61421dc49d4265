//! Trust-List Virtual File (C3, `spec.md` §4.3).
//!
//! Exposes one group's trust list as a seekable byte stream for the
//! duration of a client-side interaction: OPEN/READ/WRITE/CLOSE/
//! GET_POSITION/SET_POSITION, plus the `OpenWithMasks` and
//! `CloseAndUpdate` variants §4.5 dispatches onto this component.
//! Grounded in the file-handle lifecycle of
//! `examples/original_source/src/server/ua_server_ns0_pushmanagement.c`,
//! re-expressed with the teacher's `Arc<RwLock<..>>` guarded-registry
//! idiom (`examples/TheCowboyAI-cim-keys/src/storage/mod.rs`).

use crate::error::{GdsError, Result};
use crate::store::CertificateStore;
use crate::types::{
    ApplyChangesRequired, FileContext, FileHandle, FileInfo, GroupId, OpenMode, SessionId,
    TrustList, TrustListMask,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The seam the Transaction Manager (C4) implements so this module never
/// has to know its internal state machine (`spec.md` §9 "Dynamic dispatch").
#[async_trait]
pub trait TransactionGate: Send + Sync {
    /// Transition FRESH → PENDING bound to `session_id`, or confirm this
    /// session already owns the PENDING transaction. Fails with
    /// `TransactionPending` if another session owns it.
    async fn begin_write(&self, session_id: SessionId) -> Result<()>;

    /// Replace the staged trust-list clone for `group` with `tl`.
    async fn stage_trust_list(&self, group: &GroupId, tl: TrustList) -> Result<()>;

    /// Abort the transaction if `session_id` owns it (CLOSE on a WRITE handle).
    async fn abort_owned_by(&self, session_id: SessionId) -> Result<()>;

    /// Confirm the transaction is still owned by `session_id` and report
    /// that ApplyChanges is now expected (CLOSE_AND_UPDATE).
    async fn mark_apply_required(&self, session_id: SessionId) -> Result<ApplyChangesRequired>;
}

/// Per-group virtual-file state: the live `FileInfo` plus the store it
/// snapshots from.
pub struct TrustListFile {
    group: GroupId,
    store: Arc<dyn CertificateStore>,
    info: RwLock<FileInfo>,
}

impl TrustListFile {
    pub fn new(group: GroupId, store: Arc<dyn CertificateStore>) -> Self {
        Self {
            group,
            store,
            info: RwLock::new(FileInfo::default()),
        }
    }

    /// Current open-handle count, used by §4.5's `AddCertificate`/
    /// `RemoveCertificate` pre-conditions.
    pub async fn open_count(&self) -> usize {
        self.info.read().await.open_count()
    }

    /// OPEN(mode) — `spec.md` §4.3.
    pub async fn open(
        &self,
        session_id: SessionId,
        mode_bits: u8,
        transaction: &dyn TransactionGate,
    ) -> Result<FileHandle> {
        let mode = OpenMode::from_bits(mode_bits)
            .ok_or_else(|| GdsError::InvalidState(format!("unrecognized open mode {mode_bits:#x}")))?;

        let mut info = self.info.write().await;

        match mode {
            OpenMode::WriteEraseExisting => {
                if info.open_count() != 0 {
                    return Err(GdsError::InvalidState(
                        "group already has an open file handle".to_string(),
                    ));
                }
                transaction.begin_write(session_id).await?;
            }
            OpenMode::Read => {
                if info.file_contexts.iter().any(|c| c.open_mode == OpenMode::WriteEraseExisting) {
                    return Err(GdsError::NotReadable);
                }
            }
        }

        let snapshot = crate::trustfile::codec::encode_trust_list(
            &self.store.get_trust_list(TrustListMask::ALL).await?,
        );
        let handle = info.allocate_handle();
        info.file_contexts.push(FileContext {
            file_handle: handle,
            session_id,
            open_mode: mode,
            cursor: 0,
            snapshot,
        });
        Ok(handle)
    }

    /// OPEN_WITH_MASKS(mask) — always a read snapshot, never starts a transaction.
    pub async fn open_with_masks(
        &self,
        session_id: SessionId,
        mask: TrustListMask,
    ) -> Result<FileHandle> {
        let mut info = self.info.write().await;
        if info
            .file_contexts
            .iter()
            .any(|c| c.open_mode == OpenMode::WriteEraseExisting)
        {
            return Err(GdsError::NotReadable);
        }
        let snapshot = codec::encode_trust_list(&self.store.get_trust_list(mask).await?);
        let handle = info.allocate_handle();
        info.file_contexts.push(FileContext {
            file_handle: handle,
            session_id,
            open_mode: OpenMode::Read,
            cursor: 0,
            snapshot,
        });
        Ok(handle)
    }

    /// READ(handle, length).
    pub async fn read(&self, handle: FileHandle, length: u32) -> Result<Vec<u8>> {
        let mut info = self.info.write().await;
        let ctx = info
            .find_mut(handle)
            .ok_or_else(|| GdsError::InvalidArgument("unknown file handle".to_string()))?;
        if ctx.open_mode == OpenMode::WriteEraseExisting {
            return Err(GdsError::InvalidState(
                "handle was opened for writing".to_string(),
            ));
        }
        let start = ctx.cursor as usize;
        if start >= ctx.snapshot.len() {
            return Ok(Vec::new());
        }
        let end = (start + length as usize).min(ctx.snapshot.len());
        let chunk = ctx.snapshot[start..end].to_vec();
        ctx.cursor = end as u64;
        Ok(chunk)
    }

    /// WRITE(handle, data).
    pub async fn write(
        &self,
        handle: FileHandle,
        data: &[u8],
        transaction: &dyn TransactionGate,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let session_id = {
            let info = self.info.read().await;
            let ctx = info
                .find(handle)
                .ok_or_else(|| GdsError::InvalidArgument("unknown file handle".to_string()))?;
            if ctx.open_mode != OpenMode::WriteEraseExisting {
                return Err(GdsError::InvalidState(
                    "handle was opened for reading".to_string(),
                ));
            }
            ctx.session_id
        };
        let tl = codec::decode_trust_list(data)?;
        transaction.stage_trust_list(&self.group, tl.clone()).await?;

        let mut info = self.info.write().await;
        if let Some(ctx) = info.find_mut(handle) {
            ctx.snapshot = codec::encode_trust_list(&tl);
            let _ = session_id;
        }
        Ok(())
    }

    /// GET_POSITION(handle).
    pub async fn get_position(&self, handle: FileHandle) -> Result<u64> {
        let info = self.info.read().await;
        let ctx = info
            .find(handle)
            .ok_or_else(|| GdsError::InvalidArgument("unknown file handle".to_string()))?;
        Ok(ctx.cursor)
    }

    /// SET_POSITION(handle, position) — clamps to EOF.
    pub async fn set_position(&self, handle: FileHandle, position: u64) -> Result<()> {
        let mut info = self.info.write().await;
        let ctx = info
            .find_mut(handle)
            .ok_or_else(|| GdsError::InvalidArgument("unknown file handle".to_string()))?;
        ctx.cursor = position.min(ctx.snapshot.len() as u64);
        Ok(())
    }

    /// CLOSE(handle) — aborts the transaction if this was a WRITE handle.
    pub async fn close(&self, handle: FileHandle, transaction: &dyn TransactionGate) -> Result<()> {
        let mut info = self.info.write().await;
        let idx = info
            .file_contexts
            .iter()
            .position(|c| c.file_handle == handle)
            .ok_or_else(|| GdsError::InvalidArgument("unknown file handle".to_string()))?;
        let ctx = info.file_contexts.remove(idx);
        info.last_update_time = Some(chrono::Utc::now());
        drop(info);
        if ctx.open_mode == OpenMode::WriteEraseExisting {
            transaction.abort_owned_by(ctx.session_id).await?;
        }
        Ok(())
    }

    /// Remove every open context whose owning session is no longer live
    /// (`spec.md` §4.6 point 2), returning the handles that were freed.
    /// Does not itself touch the Transaction Manager; the Session
    /// Janitor is responsible for aborting a dead-owner transaction
    /// first (`spec.md` §4.6 point 1).
    pub async fn reap_dead_sessions(
        &self,
        registry: &dyn crate::session::SessionRegistry,
    ) -> Vec<FileHandle> {
        let mut info = self.info.write().await;
        let mut removed = Vec::new();
        let mut i = 0;
        while i < info.file_contexts.len() {
            if registry.is_live(info.file_contexts[i].session_id).await {
                i += 1;
            } else {
                removed.push(info.file_contexts.remove(i).file_handle);
            }
        }
        if !removed.is_empty() {
            info.last_update_time = Some(chrono::Utc::now());
        }
        removed
    }

    /// CLOSE_AND_UPDATE(handle) — retains the staged transaction.
    pub async fn close_and_update(
        &self,
        handle: FileHandle,
        transaction: &dyn TransactionGate,
    ) -> Result<ApplyChangesRequired> {
        let mut info = self.info.write().await;
        let idx = info
            .file_contexts
            .iter()
            .position(|c| c.file_handle == handle)
            .ok_or_else(|| GdsError::InvalidArgument("unknown file handle".to_string()))?;
        let ctx = info.file_contexts.remove(idx);
        info.last_update_time = Some(chrono::Utc::now());
        drop(info);
        if ctx.open_mode != OpenMode::WriteEraseExisting {
            return Err(GdsError::InvalidState(
                "CloseAndUpdate requires a write handle".to_string(),
            ));
        }
        transaction.mark_apply_required(ctx.session_id).await
    }
}

/// The byte encoding WRITE/READ exchange for a [`TrustList`] snapshot:
/// a length-prefixed array-of-arrays layout, little-endian, mirroring
/// the OPC UA binary encoding of a `ByteString[]` without depending on
/// an OPC UA wire-format crate this workspace doesn't otherwise carry.
pub mod codec {
    use crate::error::{GdsError, Result};
    use crate::types::{Certificate, Crl, TrustList, TrustListMask};

    pub fn encode_trust_list(tl: &TrustList) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&tl.mask().0.to_le_bytes());
        write_byte_string_array(&mut out, tl.trusted_certificates.iter().map(|c| c.as_bytes()));
        write_byte_string_array(&mut out, tl.trusted_crls.iter().map(|c| c.as_bytes()));
        write_byte_string_array(&mut out, tl.issuer_certificates.iter().map(|c| c.as_bytes()));
        write_byte_string_array(&mut out, tl.issuer_crls.iter().map(|c| c.as_bytes()));
        out
    }

    pub fn decode_trust_list(data: &[u8]) -> Result<TrustList> {
        let mut cursor = 0usize;
        let mask = TrustListMask(read_u32(data, &mut cursor)?);
        let trusted_certificates = read_byte_string_array(data, &mut cursor)?
            .into_iter()
            .map(Certificate::new)
            .collect();
        let trusted_crls = read_byte_string_array(data, &mut cursor)?
            .into_iter()
            .map(Crl::new)
            .collect();
        let issuer_certificates = read_byte_string_array(data, &mut cursor)?
            .into_iter()
            .map(Certificate::new)
            .collect();
        let issuer_crls = read_byte_string_array(data, &mut cursor)?
            .into_iter()
            .map(Crl::new)
            .collect();
        Ok(TrustList {
            specified_lists: Some(mask),
            trusted_certificates,
            trusted_crls,
            issuer_certificates,
            issuer_crls,
        })
    }

    fn write_byte_string_array<'a>(out: &mut Vec<u8>, items: impl ExactSizeIterator<Item = &'a [u8]>) {
        out.extend_from_slice(&(items.len() as u32).to_le_bytes());
        for item in items {
            out.extend_from_slice(&(item.len() as u32).to_le_bytes());
            out.extend_from_slice(item);
        }
    }

    fn read_u32(data: &[u8], cursor: &mut usize) -> Result<u32> {
        let end = *cursor + 4;
        let bytes = data
            .get(*cursor..end)
            .ok_or_else(|| GdsError::InvalidArgument("truncated trust-list encoding".to_string()))?;
        *cursor = end;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_byte_string_array(data: &[u8], cursor: &mut usize) -> Result<Vec<Vec<u8>>> {
        let count = read_u32(data, cursor)?;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = read_u32(data, cursor)? as usize;
            let end = *cursor + len;
            let bytes = data
                .get(*cursor..end)
                .ok_or_else(|| GdsError::InvalidArgument("truncated trust-list encoding".to_string()))?
                .to_vec();
            *cursor = end;
            out.push(bytes);
        }
        Ok(out)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::types::Certificate;

        #[test]
        fn round_trips_through_encode_decode() {
            let mut tl = TrustList::empty();
            tl.trusted_certificates.push(Certificate::new(vec![1, 2, 3]));
            tl.issuer_crls.push(Crl::new(vec![9, 9]));
            let encoded = encode_trust_list(&tl);
            let decoded = decode_trust_list(&encoded).unwrap();
            assert_eq!(decoded.trusted_certificates, tl.trusted_certificates);
            assert_eq!(decoded.issuer_crls, tl.issuer_crls);
        }

        #[test]
        fn rejects_truncated_input() {
            assert!(decode_trust_list(&[1, 2]).is_err());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryCertificateStore;
    use std::sync::Mutex;

    struct FakeGate {
        owner: Mutex<Option<SessionId>>,
    }

    impl FakeGate {
        fn new() -> Self {
            Self {
                owner: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl TransactionGate for FakeGate {
        async fn begin_write(&self, session_id: SessionId) -> Result<()> {
            let mut owner = self.owner.lock().unwrap();
            match *owner {
                Some(existing) if existing != session_id => Err(GdsError::TransactionPending),
                _ => {
                    *owner = Some(session_id);
                    Ok(())
                }
            }
        }

        async fn stage_trust_list(&self, _group: &GroupId, _tl: TrustList) -> Result<()> {
            Ok(())
        }

        async fn abort_owned_by(&self, _session_id: SessionId) -> Result<()> {
            *self.owner.lock().unwrap() = None;
            Ok(())
        }

        async fn mark_apply_required(&self, _session_id: SessionId) -> Result<ApplyChangesRequired> {
            Ok(ApplyChangesRequired(true))
        }
    }

    fn session() -> SessionId {
        SessionId(uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn write_open_requires_zero_open_count() {
        let store = Arc::new(MemoryCertificateStore::new(0));
        let file = TrustListFile::new(GroupId::Application, store);
        let gate = FakeGate::new();
        let s1 = session();
        let h1 = file.open(s1, 0x01, &gate).await.unwrap();
        let s2 = session();
        let result = file.open(s2, 0x06, &gate).await;
        assert!(result.is_err());
        file.close(h1, &gate).await.unwrap();
    }

    #[tokio::test]
    async fn read_while_write_open_fails_not_readable() {
        let store = Arc::new(MemoryCertificateStore::new(0));
        let file = TrustListFile::new(GroupId::Application, store);
        let gate = FakeGate::new();
        let s1 = session();
        let _write_handle = file.open(s1, 0x06, &gate).await.unwrap();
        let s2 = session();
        let result = file.open(s2, 0x01, &gate).await;
        assert!(matches!(result, Err(GdsError::NotReadable)));
    }

    #[tokio::test]
    async fn close_on_write_handle_aborts_transaction() {
        let store = Arc::new(MemoryCertificateStore::new(0));
        let file = TrustListFile::new(GroupId::Application, store);
        let gate = FakeGate::new();
        let s1 = session();
        let handle = file.open(s1, 0x06, &gate).await.unwrap();
        file.close(handle, &gate).await.unwrap();
        assert!(gate.owner.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn set_position_clamps_to_eof() {
        let store = Arc::new(MemoryCertificateStore::new(0));
        let file = TrustListFile::new(GroupId::Application, store);
        let gate = FakeGate::new();
        let handle = file.open(session(), 0x01, &gate).await.unwrap();
        file.set_position(handle, 99_999).await.unwrap();
        let pos = file.get_position(handle).await.unwrap();
        let read_back = file.read(handle, 10).await.unwrap();
        assert!(read_back.is_empty());
        assert!(pos > 0);
    }
}
