//! On-disk snapshot format (`spec.md` §6): `StateTracker`'s agent and PM
//! recovery records, serialized to a flat little-endian binary layout with a
//! CRC32 trailer, written atomically via write-temp-then-rename.
//!
//! Grounded on the teacher's `notification/store.rs` (`NotificationStore::cleanup`),
//! which writes a sibling `.tmp` file and then `fs::rename`s it over the real
//! path; this format trades JSON's self-description for a fixed byte layout
//! because the spec mandates an exact wire format rather than "whatever
//! serde_json emits".

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;

use crc32fast::Hasher as Crc32;
use tracing::warn;

use crate::error::CoreError;
use crate::model::{Agent, AgentRole, AgentState, Timestamp};
use crate::recovery::{PmRecoveryRecord, RecoveryOutcome};
use crate::target::Target;

const MAGIC: &[u8; 4] = b"TMO1";
const FORMAT_VERSION: u16 = 1;

pub struct Snapshot {
    pub created_at: Timestamp,
    pub agents: Vec<Agent>,
    pub pm_records: HashMap<String, PmRecoveryRecord>,
}

pub struct PersistenceStore {
    path: PathBuf,
}

impl PersistenceStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Write a snapshot atomically: serialize to a sibling `.tmp` file, then
    /// rename over the real path so a crash mid-write can never leave a
    /// half-written snapshot in place (`spec.md` §6).
    pub fn save(&self, agents: &[Agent], pm_records: &HashMap<String, PmRecoveryRecord>) -> Result<(), CoreError> {
        let bytes = encode(agents, pm_records);
        let tmp_path = self.path.with_extension("tmp");
        let mut file = std::fs::File::create(&tmp_path).map_err(CoreError::Io)?;
        file.write_all(&bytes).map_err(CoreError::Io)?;
        file.sync_all().map_err(CoreError::Io)?;
        std::fs::rename(&tmp_path, &self.path).map_err(CoreError::Io)?;
        Ok(())
    }

    /// Load and validate a snapshot. A missing file is not an error (first
    /// run); a present-but-corrupt file is renamed aside and treated as
    /// absent rather than aborting startup (`spec.md` §6, §8.6).
    pub fn load(&self) -> Result<Option<Snapshot>, CoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CoreError::Io(e)),
        };

        match decode(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!(error = %e, "snapshot failed validation, quarantining and starting fresh");
                self.quarantine();
                Ok(None)
            }
        }
    }

    fn quarantine(&self) {
        let suffix = match self.path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{ext}.corrupt-{}", crate::model::now_unix()),
            None => format!("corrupt-{}", crate::model::now_unix()),
        };
        let corrupt_path = self.path.with_extension(suffix);
        if let Err(e) = std::fs::rename(&self.path, &corrupt_path) {
            warn!(error = %e, "failed to quarantine corrupt snapshot");
        }
    }
}

fn encode(agents: &[Agent], pm_records: &HashMap<String, PmRecoveryRecord>) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(MAGIC);
    body.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    body.extend_from_slice(&crate::model::now_unix().to_le_bytes());

    body.extend_from_slice(&(agents.len() as u32).to_le_bytes());
    for agent in agents {
        encode_agent(&mut body, agent);
    }

    body.extend_from_slice(&(pm_records.len() as u32).to_le_bytes());
    for (session, record) in pm_records {
        encode_string(&mut body, session);
        encode_pm_record(&mut body, record);
    }

    let mut hasher = Crc32::new();
    hasher.update(&body);
    body.extend_from_slice(&hasher.finalize().to_le_bytes());
    body
}

fn encode_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn encode_agent(out: &mut Vec<u8>, agent: &Agent) {
    encode_string(out, agent.target.session());
    out.extend_from_slice(&agent.target.window().to_le_bytes());
    out.push(agent.role.as_u8());
    out.push(agent.state.as_u8());
    out.extend_from_slice(&agent.discovered_at.to_le_bytes());
    out.extend_from_slice(&agent.last_seen_active_at.to_le_bytes());
    out.extend_from_slice(&agent.consecutive_idle_samples.to_le_bytes());
    out.extend_from_slice(&agent.consecutive_missing_samples.to_le_bytes());
    match agent.briefing_digest {
        Some(digest) => {
            out.push(1);
            out.extend_from_slice(&digest);
        }
        None => out.push(0),
    }
}

fn encode_pm_record(out: &mut Vec<u8>, record: &PmRecoveryRecord) {
    out.push(record.attempt_count);
    out.extend_from_slice(&record.last_attempt_at.to_le_bytes());
    out.extend_from_slice(&record.grace_until.to_le_bytes());
    out.extend_from_slice(&record.cooldown_until.to_le_bytes());
    out.push(record.last_outcome.as_u8());
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CoreError> {
        let end = self.pos.checked_add(n).ok_or_else(|| corrupt("length overflow"))?;
        let slice = self.bytes.get(self.pos..end).ok_or_else(|| corrupt("unexpected end of snapshot"))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CoreError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CoreError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, CoreError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, CoreError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String, CoreError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| corrupt("invalid utf-8 in snapshot string"))
    }
}

fn corrupt(msg: &str) -> CoreError {
    CoreError::PersistenceFailure(msg.to_string())
}

fn decode(bytes: &[u8]) -> Result<Snapshot, CoreError> {
    if bytes.len() < 4 + 2 + 8 + 4 {
        return Err(corrupt("snapshot too short"));
    }
    let trailer_at = bytes.len() - 4;
    let (body, trailer) = bytes.split_at(trailer_at);
    let expected_crc = u32::from_le_bytes(trailer.try_into().unwrap());

    let mut hasher = Crc32::new();
    hasher.update(body);
    if hasher.finalize() != expected_crc {
        return Err(corrupt("checksum mismatch"));
    }

    let mut cursor = Cursor::new(body);
    let magic = cursor.take(4)?;
    if magic != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = cursor.u16()?;
    if version != FORMAT_VERSION {
        return Err(corrupt("unsupported snapshot version"));
    }
    let created_at = cursor.u64()?;

    let agent_count = cursor.u32()?;
    let mut agents = Vec::with_capacity(agent_count as usize);
    for _ in 0..agent_count {
        agents.push(decode_agent(&mut cursor)?);
    }

    let pm_count = cursor.u32()?;
    let mut pm_records = HashMap::with_capacity(pm_count as usize);
    for _ in 0..pm_count {
        let session = cursor.string()?;
        let record = decode_pm_record(&mut cursor)?;
        pm_records.insert(session, record);
    }

    Ok(Snapshot {
        created_at,
        agents,
        pm_records,
    })
}

fn decode_agent(cursor: &mut Cursor) -> Result<Agent, CoreError> {
    let session = cursor.string()?;
    let window = cursor.u32()?;
    let target = Target::new(&session, window).map_err(|e| corrupt(&e.to_string()))?;
    let role = AgentRole::from_u8(cursor.u8()?);
    let state = AgentState::from_u8(cursor.u8()?);
    let discovered_at = cursor.u64()?;
    let last_seen_active_at = cursor.u64()?;
    let consecutive_idle_samples = cursor.u16()?;
    let consecutive_missing_samples = cursor.u16()?;
    let has_digest = cursor.u8()?;
    let briefing_digest = if has_digest == 1 {
        let bytes = cursor.take(16)?;
        let mut digest = [0u8; 16];
        digest.copy_from_slice(bytes);
        Some(digest)
    } else {
        None
    };

    Ok(Agent {
        target,
        role,
        state,
        discovered_at,
        last_seen_active_at,
        consecutive_idle_samples,
        consecutive_missing_samples,
        briefing_digest,
    })
}

fn decode_pm_record(cursor: &mut Cursor) -> Result<PmRecoveryRecord, CoreError> {
    Ok(PmRecoveryRecord {
        attempt_count: cursor.u8()?,
        last_attempt_at: cursor.u64()?,
        grace_until: cursor.u64()?,
        cooldown_until: cursor.u64()?,
        last_outcome: RecoveryOutcome::from_u8(cursor.u8()?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn sample_agent(session: &str, window: u32) -> Agent {
        let mut agent = Agent::new_starting(Target::new(session, window).unwrap(), AgentRole::Developer, 100);
        agent.consecutive_idle_samples = 4;
        agent.state = AgentState::Idle;
        agent
    }

    #[test]
    fn round_trips_agents_and_pm_records() {
        let dir = tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().join("snapshot.bin"));

        let agents = vec![sample_agent("a", 0), sample_agent("b", 1)];
        let mut pm_records = HashMap::new();
        pm_records.insert(
            "a".to_string(),
            PmRecoveryRecord {
                attempt_count: 2,
                last_attempt_at: 500,
                grace_until: 600,
                cooldown_until: 700,
                last_outcome: RecoveryOutcome::Failure,
            },
        );

        store.save(&agents, &pm_records).unwrap();
        let snapshot = store.load().unwrap().unwrap();
        assert_eq!(snapshot.agents.len(), 2);
        assert_eq!(snapshot.pm_records.get("a").unwrap().attempt_count, 2);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().join("missing.bin"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn corrupted_checksum_is_quarantined_not_loaded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        let store = PersistenceStore::new(path.clone());
        store.save(&[sample_agent("a", 0)], &HashMap::new()).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        assert!(store.load().unwrap().is_none());
        let quarantined = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains(".corrupt-"));
        assert!(quarantined, "expected a .corrupt-<timestamp> file next to the snapshot");
    }

    #[test]
    fn repeated_corruption_preserves_each_quarantine_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        let store = PersistenceStore::new(path.clone());

        for _ in 0..2 {
            store.save(&[sample_agent("a", 0)], &HashMap::new()).unwrap();
            let mut bytes = std::fs::read(&path).unwrap();
            let last = bytes.len() - 1;
            bytes[last] ^= 0xFF;
            std::fs::write(&path, &bytes).unwrap();
            assert!(store.load().unwrap().is_none());
            std::thread::sleep(Duration::from_secs(1));
        }

        let quarantine_count = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
            .count();
        assert_eq!(quarantine_count, 2);
    }
}
