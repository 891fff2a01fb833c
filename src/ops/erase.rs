//! Erasing block contents: zero-filling the raw device or delegating to the
//! drive's ATA secure erase.

use std::io::{ErrorKind, Write};
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{BlockRef, drive};
use crate::context::AppContext;
use crate::core::jobs::FORMAT_ERASE;
use crate::core::{Caller, OpenMode};
use crate::error::StorageError;
use crate::logging::LogThrottle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseMode {
    Zero,
    AtaSecureErase,
    AtaSecureEraseEnhanced,
}

impl EraseMode {
    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "zero" => Ok(EraseMode::Zero),
            "ata-secure-erase" => Ok(EraseMode::AtaSecureErase),
            "ata-secure-erase-enhanced" => Ok(EraseMode::AtaSecureEraseEnhanced),
            other => Err(StorageError::NotSupported(format!(
                "Unknown or unsupported erase type `{}'",
                other
            ))),
        }
    }

    pub fn is_ata(&self) -> bool {
        !matches!(self, EraseMode::Zero)
    }
}

/// Write `size` zero bytes to `out` in chunks of at most `chunk` bytes.
///
/// `cancel` is checked before every write; once it is observed no further
/// write is issued. `progress` receives the running byte count after each
/// write. Returns the number of bytes written.
pub fn zero_fill<W: Write>(
    out: &mut W,
    size: u64,
    chunk: usize,
    cancel: &CancellationToken,
    mut progress: impl FnMut(u64),
) -> Result<u64, StorageError> {
    let chunk = chunk.max(1);
    let buf = vec![0u8; chunk];
    let mut pos: u64 = 0;

    while pos < size {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled("Job was canceled".to_string()));
        }
        let to_write = (size - pos).min(chunk as u64) as usize;
        let written = loop {
            match out.write(&buf[..to_write]) {
                Ok(0) => {
                    return Err(StorageError::Failed(format!(
                        "Error writing {} bytes: device accepted no data",
                        to_write
                    )));
                }
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(StorageError::io(
                        format!("Error writing {} bytes", to_write),
                        e,
                    ));
                }
            }
        };
        pos += written as u64;
        progress(pos);
    }

    Ok(pos)
}

/// Zero-fill `device` as a tracked `format-erase` job.
pub async fn zero_device(
    ctx: &AppContext,
    target: &BlockRef,
    caller: &Caller,
) -> Result<(), StorageError> {
    let device = target.device_file.clone();
    let mut file = ctx.platform.open_device(&device, OpenMode::Erase)?;
    let size = ctx.platform.device_size(&file)?;
    let chunk = ctx.config.erase_chunk_size;

    let job = ctx.jobs.begin(&ctx.db, FORMAT_ERASE, &target.path, caller).await;
    let reporter = job.reporter();
    reporter.set_total(size);
    let cancel = job.cancel_token();

    let result = tokio::task::spawn_blocking(move || {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        zero_fill(&mut file, size, chunk, &cancel, |done| {
            reporter.set_done(done);
            if throttle.should_log() {
                debug!(device = %device.display(), done, size, "Erase progress");
            }
        })
        .and_then(|_| {
            file.sync_all()
                .map_err(|e| StorageError::io(format!("Error syncing {}", device.display()), e))
        })
    })
    .await
    .unwrap_or_else(|e| Err(StorageError::Failed(format!("Erase task failed: {}", e))));

    job.finish(&result).await;
    result.map_err(|e| with_device(e, &target.device_file))
}

fn with_device(err: StorageError, device: &Path) -> StorageError {
    match err {
        StorageError::Failed(msg) => {
            StorageError::Failed(format!("{} ({})", msg, device.display()))
        }
        other => other,
    }
}

/// Erase the block behind `target` with `mode`.
pub async fn erase(
    ctx: &AppContext,
    target: &BlockRef,
    mode: EraseMode,
    caller: &Caller,
) -> Result<(), StorageError> {
    match mode {
        EraseMode::Zero => zero_device(ctx, target, caller).await,
        EraseMode::AtaSecureErase => drive::secure_erase_block(ctx, target, false, caller).await,
        EraseMode::AtaSecureEraseEnhanced => {
            drive::secure_erase_block(ctx, target, true, caller).await
        }
    }
}
