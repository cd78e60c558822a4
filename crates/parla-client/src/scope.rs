//! Background work tied to the open conversation.
//!
//! The receipt poll and the typing timer are registered here and aborted
//! together when the conversation closes.

use parla_shared::ConversationId;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Default)]
pub struct ConversationScope {
    conversation_id: Option<ConversationId>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConversationScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort whatever the previous conversation left running and start a
    /// fresh scope for `id`.
    pub fn reset(&mut self, id: Option<ConversationId>) {
        self.cancel();
        self.conversation_id = id;
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    /// Register a task. It is dropped immediately if the scope moved on to
    /// another conversation.
    pub fn attach(&mut self, id: &ConversationId, task: JoinHandle<()>) -> bool {
        if self.conversation_id.as_ref() != Some(id) {
            task.abort();
            return false;
        }
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
        true
    }

    pub fn cancel(&mut self) {
        if !self.tasks.is_empty() {
            debug!(
                conversation = ?self.conversation_id.as_ref().map(|c| c.short().to_string()),
                tasks = self.tasks.len(),
                "Cancelling conversation tasks"
            );
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ConversationScope {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn reset_aborts_running_tasks() {
        let mut scope = ConversationScope::new();
        let a = ConversationId::new("a");
        scope.reset(Some(a.clone()));
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert!(scope.attach(&a, task));
        assert_eq!(scope.len(), 1);

        scope.reset(Some(ConversationId::new("b")));
        tokio::task::yield_now().await;
        assert!(scope.is_empty());
    }

    #[tokio::test]
    async fn stale_attach_is_rejected() {
        let mut scope = ConversationScope::new();
        scope.reset(Some(ConversationId::new("b")));
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert!(!scope.attach(&ConversationId::new("a"), task));
        assert!(scope.is_empty());
    }
}
