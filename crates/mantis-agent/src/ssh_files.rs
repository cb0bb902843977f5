// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SFTP file transfer for the orchestrator's download/upload tools.

use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use mantis_core::types::SshConfig;
use mantis_core::MantisError;

use crate::ssh::dial;

/// SFTP operations get a little more headroom than interactive commands.
const SFTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Downloads a remote file, enforcing `max_bytes` both by stat and during
/// the read. Blocking.
pub fn download_file(
    config: &SshConfig,
    remote_path: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, MantisError> {
    if remote_path.is_empty() {
        return Err(MantisError::Validation("remote_path is required".into()));
    }
    let max_bytes = if max_bytes == 0 {
        10 * 1024 * 1024
    } else {
        max_bytes
    };

    let session = dial(config, SFTP_TIMEOUT)?;
    let sftp = session.sftp().map_err(sftp_err("sftp"))?;
    let mut file = sftp
        .open(Path::new(remote_path))
        .map_err(sftp_err("open remote file"))?;

    if let Ok(stat) = file.stat() {
        if let Some(size) = stat.size {
            if size > max_bytes {
                return Err(MantisError::Validation(format!(
                    "remote file too large: {size} bytes (max {max_bytes})"
                )));
            }
        }
    }

    // Double-check the size during the read as well.
    let mut data = Vec::new();
    std::io::Read::by_ref(&mut file)
        .take(max_bytes + 1)
        .read_to_end(&mut data)
        .map_err(|e| MantisError::Ssh {
            message: format!("read remote file: {e}"),
            source: Some(Box::new(e)),
        })?;
    if data.len() as u64 > max_bytes {
        return Err(MantisError::Validation(format!(
            "remote file too large: {} bytes (max {max_bytes})",
            data.len()
        )));
    }
    Ok(data)
}

/// Uploads bytes to a remote path. Without `overwrite` an existing file
/// fails the transfer. Blocking.
pub fn upload_file(
    config: &SshConfig,
    remote_path: &str,
    data: &[u8],
    mode: Option<u32>,
    overwrite: bool,
) -> Result<(), MantisError> {
    if remote_path.is_empty() {
        return Err(MantisError::Validation("remote_path is required".into()));
    }

    let session = dial(config, SFTP_TIMEOUT)?;
    let sftp = session.sftp().map_err(sftp_err("sftp"))?;

    let mut flags = ssh2::OpenFlags::WRITE | ssh2::OpenFlags::CREATE;
    if overwrite {
        flags |= ssh2::OpenFlags::TRUNCATE;
    } else {
        flags |= ssh2::OpenFlags::EXCLUSIVE;
    }

    let mut file = sftp
        .open_mode(
            Path::new(remote_path),
            flags,
            0o644,
            ssh2::OpenType::File,
        )
        .map_err(sftp_err("open remote file for write"))?;
    file.write_all(data).map_err(|e| MantisError::Ssh {
        message: format!("write remote file: {e}"),
        source: Some(Box::new(e)),
    })?;
    drop(file);

    if let Some(mode) = mode {
        sftp.setstat(
            Path::new(remote_path),
            ssh2::FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: Some(mode),
                atime: None,
                mtime: None,
            },
        )
        .map_err(sftp_err("chmod remote file"))?;
    }
    Ok(())
}

fn sftp_err(what: &'static str) -> impl Fn(ssh2::Error) -> MantisError {
    move |err| MantisError::Ssh {
        message: format!("{what}: {err}"),
        source: Some(Box::new(err)),
    }
}
