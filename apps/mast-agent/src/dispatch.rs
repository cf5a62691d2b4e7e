//! Batch dispatch: authorization, sequential execution, completion frame.
//!
//! One batch is in flight at a time (prefetch 1); a slow batch blocks this
//! replica's queue slot but not the queue itself.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use mast_auth::IdentityVerifier;
use mast_proto::{
    BatchCompleted, CommandBatch, CommandExit, CommandOutcome, CommandResult, ResultMessage,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::dedupe::CompletedCache;
use crate::executor;
use crate::policy::AuthorizationPolicy;
use crate::sink::ResultSink;

pub struct ExecutionSettings {
    pub command_timeout: Duration,
    /// Whether wildcard-group batches run through the host-namespace entry
    /// wrapper. Disabled only for local development.
    pub elevate_wildcard: bool,
}

pub struct Dispatcher {
    policy: AuthorizationPolicy,
    verifier: IdentityVerifier,
    /// Static token -> group table for service accounts, consulted before
    /// full token verification.
    service_tokens: HashMap<String, String>,
    completed: Mutex<CompletedCache>,
    settings: ExecutionSettings,
}

impl Dispatcher {
    pub fn new(
        policy: AuthorizationPolicy,
        verifier: IdentityVerifier,
        service_tokens: HashMap<String, String>,
        dedupe_capacity: usize,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            policy,
            verifier,
            service_tokens,
            completed: Mutex::new(CompletedCache::new(dedupe_capacity)),
            settings,
        }
    }

    /// Process one delivered batch end to end. Per-command failures become
    /// result lines and the next command still runs; only sink failures
    /// (broker unreachable) propagate to the caller.
    pub async fn process(&self, batch: &CommandBatch, sink: &dyn ResultSink) -> anyhow::Result<()> {
        let Some((group, rule)) = self.authorize(batch).await else {
            warn!(batch_id = %batch.batch_id, subject = %batch.issuer.subject, "no permitted group resolved, rejecting batch");
            let mut summary = Vec::with_capacity(batch.commands.len());
            for command in &batch.commands {
                sink.send(ResultMessage::Result(CommandResult {
                    batch_id: batch.batch_id.clone(),
                    command_id: command.command_id,
                    output: "authorization failed: no permitted group for this batch".into(),
                }))
                .await?;
                summary.push(CommandExit {
                    command_id: command.command_id,
                    command: command.command.clone(),
                    outcome: CommandOutcome::Rejected,
                });
            }
            return self.complete(batch, summary, sink).await;
        };

        let elevated = rule.is_wildcard() && self.settings.elevate_wildcard;
        info!(
            batch_id = %batch.batch_id,
            subject = %batch.issuer.subject,
            %group,
            wildcard = rule.is_wildcard(),
            commands = batch.commands.len(),
            "authorized batch"
        );

        let mut summary = Vec::with_capacity(batch.commands.len());
        for command in &batch.commands {
            let outcome = if self
                .completed
                .lock()
                .await
                .contains(&batch.batch_id, command.command_id)
            {
                info!(batch_id = %batch.batch_id, command_id = command.command_id, "skipping command already run by a previous delivery");
                sink.send(ResultMessage::Result(CommandResult {
                    batch_id: batch.batch_id.clone(),
                    command_id: command.command_id,
                    output: "skipped: already executed by a previous delivery".into(),
                }))
                .await?;
                CommandOutcome::Skipped
            } else if !rule.allows(&command.command) {
                warn!(
                    batch_id = %batch.batch_id,
                    command_id = command.command_id,
                    %group,
                    command = %command.command,
                    "command not permitted for group"
                );
                sink.send(ResultMessage::Result(CommandResult {
                    batch_id: batch.batch_id.clone(),
                    command_id: command.command_id,
                    output: format!(
                        "group '{}' is not allowed to run '{}'",
                        group, command.command
                    ),
                }))
                .await?;
                CommandOutcome::Rejected
            } else {
                let outcome = executor::execute(
                    sink,
                    &batch.batch_id,
                    command.command_id,
                    &command.command,
                    elevated,
                    self.settings.command_timeout,
                )
                .await?;
                self.completed
                    .lock()
                    .await
                    .record(&batch.batch_id, command.command_id);
                outcome
            };
            summary.push(CommandExit {
                command_id: command.command_id,
                command: command.command.clone(),
                outcome,
            });
        }
        self.complete(batch, summary, sink).await
    }

    async fn complete(
        &self,
        batch: &CommandBatch,
        exit_summary: Vec<CommandExit>,
        sink: &dyn ResultSink,
    ) -> anyhow::Result<()> {
        sink.send(ResultMessage::Completed(BatchCompleted {
            batch_id: batch.batch_id.clone(),
            exit_summary,
        }))
        .await
    }

    /// Re-derive the issuer's authorization group from the batch's embedded
    /// identity: the static service-token table first, then full token
    /// verification. The embedded groups claim is never trusted on its own.
    async fn authorize(&self, batch: &CommandBatch) -> Option<(String, &crate::policy::CommandRule)> {
        if let Some(group) = self.service_tokens.get(&batch.issuer.raw_token) {
            if let Some(rule) = self.policy.groups.get(group) {
                return Some((group.clone(), rule));
            }
            warn!(%group, "service token maps to a group the policy does not know");
        }

        match self.verifier.verify(&batch.issuer.raw_token).await {
            Ok(claims) => {
                let groups: BTreeSet<String> = claims.groups;
                self.policy
                    .resolve(&groups)
                    .map(|(name, rule)| (name.to_string(), rule))
            }
            Err(err) => {
                warn!(batch_id = %batch.batch_id, error = %err, "embedded token failed verification");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::memory::MemorySink;
    use mast_auth::{testing::unsigned_token, AuthConfig};
    use mast_proto::Issuer;
    use serde_json::json;

    fn bypass_verifier() -> IdentityVerifier {
        IdentityVerifier::with_keys(
            AuthConfig {
                bypass: true,
                ..Default::default()
            },
            HashMap::new(),
        )
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            AuthorizationPolicy::default(),
            bypass_verifier(),
            HashMap::from([("svc-token".to_string(), "developers".to_string())]),
            64,
            ExecutionSettings {
                command_timeout: Duration::from_secs(10),
                elevate_wildcard: false,
            },
        )
    }

    fn batch_for(groups: &[&str], commands: &[&str]) -> CommandBatch {
        let token = unsigned_token(&json!({
            "sub": "alice",
            "name": "Alice",
            "groups": groups,
        }));
        let issuer = Issuer {
            subject: "alice".into(),
            display_name: Some("Alice".into()),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            raw_token: token,
        };
        let commands: Vec<String> = commands.iter().map(|c| c.to_string()).collect();
        CommandBatch::new(&commands, issuer)
    }

    fn outputs(sink: &MemorySink) -> Vec<String> {
        sink.messages
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                ResultMessage::Result(r) => Some(r.output.clone()),
                _ => None,
            })
            .collect()
    }

    fn completion(sink: &MemorySink) -> Vec<BatchCompleted> {
        sink.messages
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                ResultMessage::Completed(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn disallowed_command_is_rejected_without_execution() {
        let dispatcher = dispatcher();
        let sink = MemorySink::default();
        let marker = "/tmp/mast-dispatch-rejection-marker";
        let command = format!("touch {marker}");
        let batch = batch_for(&["developers"], &[command.as_str()]);
        dispatcher.process(&batch, &sink).await.unwrap();

        let outputs = outputs(&sink);
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].contains("developers"));
        assert!(outputs[0].contains("touch"));
        assert!(!std::path::Path::new(marker).exists());

        let completed = completion(&sink);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].exit_summary[0].outcome, CommandOutcome::Rejected);
    }

    #[tokio::test]
    async fn allowed_commands_run_in_order_with_correct_ids() {
        let dispatcher = dispatcher();
        let sink = MemorySink::default();
        let batch = batch_for(&["developers"], &["whoami", "uptime"]);
        dispatcher.process(&batch, &sink).await.unwrap();

        let messages = sink.messages.lock().unwrap().clone();
        let ids: Vec<u32> = messages
            .iter()
            .filter_map(|m| match m {
                ResultMessage::Result(r) => Some(r.command_id),
                _ => None,
            })
            .collect();
        // Lines for command 0 all precede lines for command 1.
        let first_one = ids.iter().position(|&id| id == 1);
        if let Some(pos) = first_one {
            assert!(ids[..pos].iter().all(|&id| id == 0));
            assert!(ids[pos..].iter().all(|&id| id == 1));
        }

        let completed = completion(&sink);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].exit_summary.len(), 2);
        assert!(matches!(
            completed[0].exit_summary[0].outcome,
            CommandOutcome::Completed { exit_code: Some(0) }
        ));
    }

    #[tokio::test]
    async fn wildcard_group_bypasses_allow_set() {
        let dispatcher = dispatcher();
        let sink = MemorySink::default();
        // `date` is not in the developers allow-set but administrators may
        // run anything.
        let batch = batch_for(&["administrators"], &["date"]);
        dispatcher.process(&batch, &sink).await.unwrap();

        let completed = completion(&sink);
        assert!(matches!(
            completed[0].exit_summary[0].outcome,
            CommandOutcome::Completed { exit_code: Some(0) }
        ));
    }

    #[tokio::test]
    async fn unknown_group_yields_observable_rejection() {
        let dispatcher = dispatcher();
        let sink = MemorySink::default();
        let batch = batch_for(&["guests"], &["whoami"]);
        dispatcher.process(&batch, &sink).await.unwrap();

        let outputs = outputs(&sink);
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].contains("authorization failed"));
        let completed = completion(&sink);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].exit_summary[0].outcome, CommandOutcome::Rejected);
    }

    #[tokio::test]
    async fn service_token_table_resolves_before_verification() {
        let dispatcher = dispatcher();
        let sink = MemorySink::default();
        let issuer = Issuer {
            subject: "ci-bot".into(),
            display_name: None,
            groups: BTreeSet::new(),
            raw_token: "svc-token".into(),
        };
        let batch = CommandBatch::new(&["whoami".to_string()], issuer);
        dispatcher.process(&batch, &sink).await.unwrap();

        let completed = completion(&sink);
        assert!(matches!(
            completed[0].exit_summary[0].outcome,
            CommandOutcome::Completed { exit_code: Some(0) }
        ));
    }

    #[tokio::test]
    async fn redelivered_commands_are_skipped() {
        let dispatcher = dispatcher();
        let sink = MemorySink::default();
        let batch = batch_for(&["developers"], &["whoami"]);
        dispatcher.process(&batch, &sink).await.unwrap();

        let redelivery = MemorySink::default();
        dispatcher.process(&batch, &redelivery).await.unwrap();
        let outputs = outputs(&redelivery);
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].contains("skipped"));
        assert_eq!(
            completion(&redelivery)[0].exit_summary[0].outcome,
            CommandOutcome::Skipped
        );
    }
}
