//! Append-only command journal.
//!
//! Every command state change is written as one JSON line holding the full
//! command snapshot. Replay keeps the last snapshot per command id, in order
//! of first appearance, and compacts the file to exactly those snapshots.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::Command;

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt journal entry at line {line}: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

pub struct Journal {
    path: PathBuf,
    file: Mutex<File>,
}

impl Journal {
    /// Open (or create) the journal at `path` and return the replayed
    /// commands. A torn final line, as left by a crash mid-write, is skipped.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<Command>), JournalError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| JournalError::Io {
            path: path.clone(),
            source,
        };

        let commands = if path.exists() {
            let file = File::open(&path).map_err(io_err)?;
            replay(BufReader::new(file)).map_err(|e| match e {
                ReplayError::Io(source) => io_err(source),
                ReplayError::Corrupt { line, source } => JournalError::Corrupt { line, source },
            })?
        } else {
            Vec::new()
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        compact(&path, &commands).map_err(io_err)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        tracing::info!(path = %path.display(), commands = commands.len(), "command journal opened");
        Ok((
            Self {
                path,
                file: Mutex::new(file),
            },
            commands,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, command: &Command) -> Result<(), JournalError> {
        let mut line = serde_json::to_vec(command).map_err(|source| JournalError::Corrupt {
            line: 0,
            source,
        })?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)
            .and_then(|_| file.flush())
            .map_err(|source| JournalError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

enum ReplayError {
    Io(std::io::Error),
    Corrupt { line: usize, source: serde_json::Error },
}

fn replay(reader: impl BufRead) -> Result<Vec<Command>, ReplayError> {
    let lines: Vec<String> = reader
        .lines()
        .collect::<Result<_, _>>()
        .map_err(ReplayError::Io)?;
    let last = lines.len();

    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, Command> = HashMap::new();
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let command: Command = match serde_json::from_str(line) {
            Ok(c) => c,
            Err(e) if idx + 1 == last => {
                tracing::warn!(line = idx + 1, error = %e, "skipping torn journal tail");
                continue;
            }
            Err(source) => {
                return Err(ReplayError::Corrupt {
                    line: idx + 1,
                    source,
                })
            }
        };
        if !latest.contains_key(&command.id) {
            order.push(command.id.clone());
        }
        latest.insert(command.id.clone(), command);
    }
    Ok(order
        .into_iter()
        .filter_map(|id| latest.remove(&id))
        .collect())
}

fn compact(path: &Path, commands: &[Command]) -> std::io::Result<()> {
    let tmp = path.with_extension("compact");
    {
        let mut out = std::io::BufWriter::new(File::create(&tmp)?);
        for command in commands {
            serde_json::to_writer(&mut out, command)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
    }
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::CommandStatus;
    use crate::protocol::CommandType;
    use chrono::Utc;

    fn command(id: &str, status: CommandStatus) -> Command {
        let now = Utc::now();
        Command {
            id: id.into(),
            session_id: "s1".into(),
            agent_id: Some("agent-a".into()),
            command_type: CommandType::Start,
            payload: serde_json::Value::Null,
            status,
            attempt_count: 1,
            created_at: now,
            updated_at: now,
            expires_at: now,
            next_attempt_at: now,
            ack_deadline: None,
            detail: None,
        }
    }

    #[test]
    fn replay_keeps_latest_snapshot_in_first_seen_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commands.jsonl");
        {
            let (journal, replayed) = Journal::open(&path).unwrap();
            assert!(replayed.is_empty());
            journal.append(&command("c1", CommandStatus::Pending)).unwrap();
            journal.append(&command("c2", CommandStatus::Pending)).unwrap();
            journal.append(&command("c1", CommandStatus::Acked)).unwrap();
        }

        let (_journal, replayed) = Journal::open(&path).unwrap();
        let ids: Vec<&str> = replayed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert_eq!(replayed[0].status, CommandStatus::Acked);

        // Compacted to one line per command.
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn torn_tail_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commands.jsonl");
        let good = serde_json::to_string(&command("c1", CommandStatus::Pending)).unwrap();
        std::fs::write(&path, format!("{good}\n{{\"id\":\"c2\",\"sess")).unwrap();

        let (_journal, replayed) = Journal::open(&path).unwrap();
        assert_eq!(replayed.len(), 1);
    }

    #[test]
    fn corruption_before_the_tail_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commands.jsonl");
        let good = serde_json::to_string(&command("c1", CommandStatus::Pending)).unwrap();
        std::fs::write(&path, format!("garbage\n{good}\n")).unwrap();

        assert!(matches!(
            Journal::open(&path),
            Err(JournalError::Corrupt { line: 1, .. })
        ));
    }
}
