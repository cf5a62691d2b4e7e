//! Seam between command processing and the results queue.

use async_trait::async_trait;
use mast_proto::ResultMessage;

/// Destination for result frames. The dispatcher forwards each output line
/// the moment it is read, so delivery latency tracks subprocess output
/// latency rather than batch completion.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn send(&self, message: ResultMessage) -> anyhow::Result<()>;
}

/// In-memory sink collecting every frame, for tests.
#[cfg(test)]
pub mod memory {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemorySink {
        pub messages: Mutex<Vec<ResultMessage>>,
    }

    #[async_trait]
    impl ResultSink for MemorySink {
        async fn send(&self, message: ResultMessage) -> anyhow::Result<()> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }
    }
}
