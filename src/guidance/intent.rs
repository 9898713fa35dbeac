use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::llm::registry::ProviderRegistry;

/// Triage result for one user message.
#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub is_task: bool,
    /// The goal description when `is_task` (verbatim or model-refined).
    pub description: String,
}

/// Exact-match tokens that are never tasks. Checked before anything costs money.
const GREETINGS: [&str; 12] = [
    "hi", "hello", "hey", "yo", "thanks", "thank you", "ok", "okay", "yes", "no", "cool", "nice",
];

/// Messages this long that mention one of these are tasks without asking a model.
const TASK_KEYWORDS: [&str; 6] = ["how", "help", "want", "need", "show", "teach"];
const MIN_TASK_LEN: usize = 12;

const CLASSIFY_SYSTEM: &str = "\
You classify a user message for a screen-guidance assistant. \
Respond with strict JSON only, no prose: \
{\"isTask\": true|false, \"task\": \"<the task restated, or empty>\"}";

#[derive(Debug, Deserialize)]
struct ClassifyReply {
    #[serde(rename = "isTask")]
    is_task: bool,
    #[serde(default)]
    task: String,
}

/// Cheap local/remote triage of a user message into {task, conversational}.
pub struct IntentClassifier {
    registry: Arc<Mutex<ProviderRegistry>>,
}

impl IntentClassifier {
    pub fn new(registry: Arc<Mutex<ProviderRegistry>>) -> Self {
        Self { registry }
    }

    pub async fn classify(&self, message: &str) -> Intent {
        let trimmed = message.trim();
        let lc = trimmed.to_lowercase();

        if GREETINGS.contains(&lc.as_str()) {
            return Intent {
                is_task: false,
                description: String::new(),
            };
        }

        if trimmed.len() >= MIN_TASK_LEN && TASK_KEYWORDS.iter().any(|k| lc.contains(k)) {
            return Intent {
                is_task: true,
                description: trimmed.to_string(),
            };
        }

        self.classify_remote(trimmed).await
    }

    /// One low-cost routing-model call. Any failure (provider missing,
    /// network, unparseable reply) defaults to "it's a task": failing
    /// toward being helpful beats staying silent.
    async fn classify_remote(&self, message: &str) -> Intent {
        let call = {
            let reg = self.registry.lock().await;
            reg.call_config_for_role("routing")
        };
        let (provider, cfg) = match call {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "no routing provider, assuming task");
                return Intent {
                    is_task: true,
                    description: message.to_string(),
                };
            }
        };

        let prompt = format!("Message: {message}");
        match provider
            .analyze(&[], &prompt, Some(CLASSIFY_SYSTEM), &cfg)
            .await
        {
            Ok(text) => match parse_classify_reply(&text) {
                Some(reply) => Intent {
                    is_task: reply.is_task,
                    description: if reply.task.is_empty() {
                        message.to_string()
                    } else {
                        reply.task
                    },
                },
                None => {
                    tracing::warn!(reply = %text, "unparseable classifier reply, assuming task");
                    Intent {
                        is_task: true,
                        description: message.to_string(),
                    }
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "classifier call failed, assuming task");
                Intent {
                    is_task: true,
                    description: message.to_string(),
                }
            }
        }
    }
}

fn parse_classify_reply(text: &str) -> Option<ClassifyReply> {
    // Models love wrapping JSON in fences; take the first object either way.
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> IntentClassifier {
        // Empty registry: remote classification falls back to "task".
        IntentClassifier::new(Arc::new(Mutex::new(ProviderRegistry::new(String::new()))))
    }

    #[tokio::test]
    async fn test_greetings_are_not_tasks() {
        let c = classifier();
        assert!(!c.classify("hi").await.is_task);
        assert!(!c.classify("  Thanks  ").await.is_task);
        assert!(!c.classify("okay").await.is_task);
    }

    #[tokio::test]
    async fn test_keyword_messages_are_tasks_verbatim() {
        let c = classifier();
        let msg = "How do I freeze the top row in Excel?";
        let intent = c.classify(msg).await;
        assert!(intent.is_task);
        assert_eq!(intent.description, msg);
    }

    #[tokio::test]
    async fn test_short_keyword_message_goes_remote() {
        // "how?" is under the length floor, so the cheap filter passes on it;
        // with no provider configured the fallback answer is "task".
        let c = classifier();
        let intent = c.classify("how?").await;
        assert!(intent.is_task);
    }

    #[test]
    fn test_classify_reply_parsing() {
        let reply = parse_classify_reply("```json\n{\"isTask\": true, \"task\": \"open settings\"}\n```").unwrap();
        assert!(reply.is_task);
        assert_eq!(reply.task, "open settings");
        assert!(parse_classify_reply("sure, happy to help!").is_none());
    }
}
