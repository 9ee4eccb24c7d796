//! Request composition: prompts, history, attachments
//!
//! Assembles the message sequence sent to the model gateway:
//! [system, evidence system?, ...history, user]. Also owns reasoning-effort
//! validation and the time-sensitivity check used by scoring and planning.

use crate::completions::PromptMessage;
use crate::evidence::EvidenceItem;

/// Prompt phrases that mark a question as time-sensitive
const TIME_SENSITIVE_KEYWORDS: &[&str] = &[
    "latest", "newest", "current", "today", "right now", "as of", "recent",
    "this week", "this month", "breaking",
];

/// Per-attachment extracted-text budget (characters)
const ATTACHMENT_FILE_BUDGET: usize = 4_000;

/// Total attachment budget across one request (characters)
const ATTACHMENT_TOTAL_BUDGET: usize = 12_000;

const ATTACHMENT_TRUNCATION_MARKER: &str =
    "[Some attached file content was omitted to fit the context budget.]";

/// Evidence snippet / extract excerpt length in the evidence block
const EVIDENCE_EXCERPT_CHARS: usize = 700;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMode {
    Chat,
    DeepResearch,
}

impl ChatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::DeepResearch => "deep_research",
        }
    }
}

/// Accepted reasoning effort values
pub fn valid_effort(effort: &str) -> bool {
    matches!(effort, "low" | "medium" | "high")
}

/// Whether the user prompt asks about a moving target
pub fn is_time_sensitive(text: &str) -> bool {
    let lower = text.to_lowercase();
    TIME_SENSITIVE_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Base system prompt for plain chat
pub fn chat_system_prompt() -> String {
    "You are a careful, well-read assistant. Answer directly and concisely. \
     When web evidence is provided, ground your answer in it and cite sources \
     with bracketed numbers like [1] that refer to the numbered evidence list. \
     Never cite a number that is not in the list."
        .to_string()
}

/// System prompt for deep research answers; mandates the report layout
pub fn deep_research_system_prompt() -> String {
    "You are a research analyst writing up the findings of a web research run. \
     Structure your answer with exactly these sections, in order:\n\
     1. Direct Answer\n\
     2. Key Evidence\n\
     3. Conflicting Signals\n\
     4. Recommendations\n\
     5. Source List\n\
     Cite sources inline with bracketed numbers like [2] that refer to the \
     numbered evidence list you were given. Never invent citations and never \
     cite a number that is not in the list. If the evidence is thin, say so \
     in Conflicting Signals rather than padding."
        .to_string()
}

/// Numbered evidence block presented to the model. Citation markers in the
/// answer resolve against exactly this order.
pub fn evidence_system_message(items: &[EvidenceItem]) -> String {
    let mut out = String::from(
        "Web evidence gathered for this question. Cite with [n] where n is \
         the item number below.\n\n",
    );
    for (i, item) in items.iter().enumerate() {
        let excerpt = item
            .extracted_text
            .as_deref()
            .unwrap_or(&item.citation.snippet);
        let excerpt: String = excerpt.chars().take(EVIDENCE_EXCERPT_CHARS).collect();
        out.push_str(&format!(
            "[{n}] {title}\n{url}\n{excerpt}\n\n",
            n = i + 1,
            title = item.citation.title,
            url = item.citation.url,
        ));
    }
    out.trim_end().to_string()
}

/// One prior message as loaded from the store
#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

/// Extracted text of one attached file
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub extracted_text: String,
}

/// Append attachment text to the user message under per-file and global
/// budgets; a single marker sentence flags any truncation.
pub fn apply_attachments(message: &str, attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return message.to_string();
    }

    let mut out = String::from(message);
    let mut total = 0usize;
    let mut truncated = false;

    for attachment in attachments {
        if total >= ATTACHMENT_TOTAL_BUDGET {
            truncated = true;
            break;
        }
        let budget = ATTACHMENT_FILE_BUDGET.min(ATTACHMENT_TOTAL_BUDGET - total);
        let text: String = attachment.extracted_text.chars().take(budget).collect();
        if text.len() < attachment.extracted_text.len() {
            truncated = true;
        }
        total += text.len();
        out.push_str(&format!("\n\n--- Attached file: {} ---\n{}", attachment.name, text));
    }

    if truncated {
        out.push_str(&format!("\n\n{ATTACHMENT_TRUNCATION_MARKER}"));
    }
    out
}

/// Assemble the full prompt sequence for the model gateway
pub fn compose_messages(
    mode: ChatMode,
    evidence: &[EvidenceItem],
    history: &[HistoryMessage],
    user_message: &str,
) -> Vec<PromptMessage> {
    let system = match mode {
        ChatMode::Chat => chat_system_prompt(),
        ChatMode::DeepResearch => deep_research_system_prompt(),
    };

    let mut messages = vec![PromptMessage::system(system)];

    if !evidence.is_empty() {
        messages.push(PromptMessage::system(evidence_system_message(evidence)));
    }

    for entry in history {
        match entry.role.as_str() {
            "user" => messages.push(PromptMessage::user(entry.content.clone())),
            "assistant" => messages.push(PromptMessage::assistant(entry.content.clone())),
            _ => {}
        }
    }

    messages.push(PromptMessage::user(user_message.to_string()));
    messages
}
