//! Mast wire protocol: the message shapes shared by the controller and the
//! agent fleet.
//!
//! Two durable queues connect the components: `commands` carries
//! [`CommandBatch`] messages from the controller to agents, `results` carries
//! [`ResultMessage`] frames back. Bodies are JSON, delivery mode persistent.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Queue the controller publishes batches onto.
pub const COMMANDS_QUEUE: &str = "commands";
/// Queue agents publish result lines onto.
pub const RESULTS_QUEUE: &str = "results";

/// One shell command inside a batch. `command_id` values are assigned by the
/// controller as a 0-based sequential index and are unique within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub command_id: u32,
    pub command: String,
}

/// Identity of the caller that submitted a batch. The raw token rides along
/// so agents can re-verify it instead of trusting the controller's check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issuer {
    pub subject: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    pub raw_token: String,
}

/// An ordered set of shell commands dispatched as one unit. Immutable once
/// published; agents process the commands in list order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandBatch {
    pub batch_id: String,
    pub commands: Vec<Command>,
    pub issuer: Issuer,
}

impl CommandBatch {
    /// Build a batch from raw command strings, assigning sequential ids and
    /// deriving the deterministic batch id from the issuer subject.
    pub fn new(commands: &[String], issuer: Issuer) -> Self {
        let batch_id = derive_batch_id(&issuer.subject, commands);
        let commands = commands
            .iter()
            .enumerate()
            .map(|(i, c)| Command {
                command_id: i as u32,
                command: c.clone(),
            })
            .collect();
        Self {
            batch_id,
            commands,
            issuer,
        }
    }
}

/// One line of combined stdout/stderr, or a synthetic status line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub batch_id: String,
    pub command_id: u32,
    pub output: String,
}

/// How a single command in a batch ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CommandOutcome {
    /// Subprocess ran to completion; non-zero exit codes are reported here,
    /// not escalated.
    Completed { exit_code: Option<i32> },
    /// Blocked by the authorization policy; no subprocess was spawned.
    Rejected,
    /// Killed after exceeding the per-command timeout.
    TimedOut,
    /// Suppressed because a previous delivery already ran it.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandExit {
    pub command_id: u32,
    pub command: String,
    #[serde(flatten)]
    pub outcome: CommandOutcome,
}

/// Terminal frame for a batch's result stream. Emitted exactly once per
/// processed batch so consumers do not have to rely on timeouts to detect
/// end of stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCompleted {
    pub batch_id: String,
    pub exit_summary: Vec<CommandExit>,
}

/// Everything that can appear on the results queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ResultMessage {
    Result(CommandResult),
    Completed(BatchCompleted),
}

impl ResultMessage {
    pub fn batch_id(&self) -> &str {
        match self {
            ResultMessage::Result(r) => &r.batch_id,
            ResultMessage::Completed(c) => &c.batch_id,
        }
    }
}

/// Derive a batch id from the issuer subject plus a hash of the command
/// list. Deliberately deterministic: two identical submissions by the same
/// user produce the same id, making duplicate resubmissions detectable
/// downstream.
pub fn derive_batch_id(subject: &str, commands: &[String]) -> String {
    let encoded = serde_json::to_vec(commands).unwrap_or_default();
    let digest = Sha256::digest(&encoded);
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("{subject}-{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer(subject: &str) -> Issuer {
        Issuer {
            subject: subject.into(),
            display_name: Some("Test User".into()),
            groups: BTreeSet::from(["developers".to_string()]),
            raw_token: "tok".into(),
        }
    }

    #[test]
    fn command_ids_are_sequential_from_zero() {
        let commands: Vec<String> = vec!["whoami".into(), "date".into(), "uptime".into()];
        let batch = CommandBatch::new(&commands, issuer("alice"));
        let ids: Vec<u32> = batch.commands.iter().map(|c| c.command_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(batch.commands[1].command, "date");
    }

    #[test]
    fn batch_id_is_idempotent_per_issuer_and_commands() {
        let commands: Vec<String> = vec!["whoami".into()];
        let first = CommandBatch::new(&commands, issuer("alice"));
        let second = CommandBatch::new(&commands, issuer("alice"));
        assert_eq!(first.batch_id, second.batch_id);
    }

    #[test]
    fn batch_id_differs_across_issuers_and_command_lists() {
        let commands: Vec<String> = vec!["whoami".into()];
        let alice = derive_batch_id("alice", &commands);
        let bob = derive_batch_id("bob", &commands);
        assert_ne!(alice, bob);
        assert!(alice.starts_with("alice-"));

        let other: Vec<String> = vec!["date".into()];
        assert_ne!(derive_batch_id("alice", &other), alice);
    }

    #[test]
    fn result_message_roundtrips_with_kind_tag() {
        let msg = ResultMessage::Result(CommandResult {
            batch_id: "alice-00".into(),
            command_id: 0,
            output: "hello\n".into(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"kind\":\"result\""));
        let back: ResultMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.batch_id(), "alice-00");
    }

    #[test]
    fn completed_frame_carries_exit_summary() {
        let msg = ResultMessage::Completed(BatchCompleted {
            batch_id: "b".into(),
            exit_summary: vec![CommandExit {
                command_id: 0,
                command: "whoami".into(),
                outcome: CommandOutcome::Completed { exit_code: Some(0) },
            }],
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "completed");
        assert_eq!(json["exit_summary"][0]["outcome"], "completed");
    }
}
