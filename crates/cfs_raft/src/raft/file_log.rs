//! File-backed `LogStore`.
//!
//! Log entries are appended as `len | crc32 | json` records and synced before
//! `append` returns. A torn record at the tail (crash mid-write) is cut off
//! on open; a checksum mismatch anywhere else is treated as corruption. The
//! hard state lives in its own file, replaced atomically via rename.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context};
use crc32fast::Hasher;

use super::types::{HardState, LogEntry, LogIndex, LogStore};

const LOG_FILE: &str = "raft.log";
const HARD_STATE_FILE: &str = "hardstate.json";

pub struct FileLog {
    dir: PathBuf,
    log_path: PathBuf,
    hard_state_path: PathBuf,
    file: Mutex<File>,
}

impl FileLog {
    pub fn open_dir(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("create raft dir {}", dir.display()))?;
        let log_path = dir.join(LOG_FILE);
        let hard_state_path = dir.join(HARD_STATE_FILE);

        let (_, valid_len) = scan_records(&log_path)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("open raft log {}", log_path.display()))?;
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            tracing::warn!(
                path = %log_path.display(),
                dropped_bytes = on_disk - valid_len,
                "truncating torn raft log tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(Self {
            dir,
            log_path,
            hard_state_path,
            file: Mutex::new(file),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl LogStore for FileLog {
    fn load(&self) -> anyhow::Result<(HardState, Vec<LogEntry>)> {
        let hard = match fs::read(&self.hard_state_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).context("decode raft hard state")?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HardState::default(),
            Err(err) => return Err(err.into()),
        };
        let (entries, _) = scan_records(&self.log_path)?;
        Ok((hard, entries))
    }

    fn save_hard_state(&self, state: HardState) -> anyhow::Result<()> {
        let tmp = self.hard_state_path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(&state)?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.hard_state_path).context("replace raft hard state")?;
        Ok(())
    }

    fn append(&self, entries: &[LogEntry]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("raft log lock poisoned"))?;
        for entry in entries {
            let payload = serde_json::to_vec(entry)?;
            write_record(&mut file, &payload)?;
        }
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    fn truncate_from(&self, from: LogIndex) -> anyhow::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("raft log lock poisoned"))?;
        let (entries, _) = scan_records(&self.log_path)?;
        let tmp = self.log_path.with_extension("log.tmp");
        {
            let mut out = File::create(&tmp)?;
            for entry in entries.iter().filter(|entry| entry.index < from) {
                write_record(&mut out, &serde_json::to_vec(entry)?)?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.log_path).context("replace raft log")?;
        *file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.log_path)?;
        Ok(())
    }
}

fn write_record(file: &mut File, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len() as u32;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    file.write_all(&len.to_be_bytes())?;
    file.write_all(&checksum.to_be_bytes())?;
    file.write_all(payload)?;
    Ok(())
}

/// Decode every complete record; also returns the byte length they cover.
fn scan_records(path: &Path) -> anyhow::Result<(Vec<LogEntry>, u64)> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut valid_len = 0u64;
    loop {
        let mut header = [0u8; 8];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected_crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let mut payload = vec![0u8; len];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        anyhow::ensure!(
            hasher.finalize() == expected_crc,
            "raft log checksum mismatch at offset {valid_len}"
        );
        let entry: LogEntry = serde_json::from_slice(&payload).context("decode raft log entry")?;
        entries.push(entry);
        valid_len += 8 + len as u64;
    }
    Ok((entries, valid_len))
}
