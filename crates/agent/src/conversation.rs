//! One chat session: message history, the working draft and the turn loop
//! that streams a reply, extracts the invoice block and merges it.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use invoicey_core::config::AppConfig;
use invoicey_core::drafting::{merge_extraction, ClientMatch, MergeReport};
use invoicey_core::{ClientRoster, InvoiceDraft};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::extract::{BlockExtractor, Extraction};
use crate::llm::{ChatBackend, ChatRequest, TransportError};
use crate::prompt::system_instruction;
use crate::stream::{accumulate, StreamInterrupted};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    pub block_tag: String,
    /// Upper bound on one turn, connection included.
    pub turn_timeout: Duration,
    /// Date given to the assistant for resolving "today" or "next Friday".
    pub today: NaiveDate,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig, today: NaiveDate) -> Self {
        Self {
            block_tag: config.invoice.block_tag.clone(),
            turn_timeout: Duration::from_secs(config.llm.timeout_secs),
            today,
        }
    }
}

/// What a completed turn did to the draft.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DraftUpdate {
    Unchanged,
    Merged(MergeReport),
    /// A tagged block could not be parsed. Callers treat this exactly like
    /// `Unchanged`; the variant exists for diagnostics only.
    MalformedBlock,
}

#[derive(Debug)]
pub enum TurnOutcome {
    Replied {
        /// Reply with the invoice block removed, ready for display.
        reply: String,
        update: DraftUpdate,
    },
    /// The stream failed or timed out. `message` was appended to the history
    /// as the assistant's reply; the draft is unchanged.
    Failed { error: TransportError, message: String, partial_text: String },
    /// Nothing was appended beyond the user's message; the draft is unchanged.
    Cancelled { partial_text: String },
}

pub struct ChatSession {
    history: Vec<Message>,
    draft: InvoiceDraft,
    roster: Arc<ClientRoster>,
    extractor: BlockExtractor,
    settings: SessionSettings,
}

impl ChatSession {
    pub fn new(draft: InvoiceDraft, roster: Arc<ClientRoster>, settings: SessionSettings) -> Self {
        Self {
            history: Vec::new(),
            draft,
            roster,
            extractor: BlockExtractor::new(settings.block_tag.clone()),
            settings,
        }
    }

    /// Raw history as sent to the model, invoice blocks included.
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// History for display, with invoice blocks stripped from assistant
    /// messages.
    pub fn transcript(&self) -> Vec<Message> {
        self.history
            .iter()
            .map(|message| match message.role {
                Role::User => message.clone(),
                Role::Assistant => Message::assistant(self.extractor.clean_text(&message.content)),
            })
            .collect()
    }

    pub fn draft(&self) -> &InvoiceDraft {
        &self.draft
    }

    /// Direct form edits between turns.
    pub fn draft_mut(&mut self) -> &mut InvoiceDraft {
        &mut self.draft
    }

    pub fn into_draft(self) -> InvoiceDraft {
        self.draft
    }

    pub fn roster(&self) -> &ClientRoster {
        &self.roster
    }

    /// Runs one turn. `on_partial` receives the displayable reply each time
    /// it grows; it never sees any part of the invoice block. Taking `&mut
    /// self` keeps a session to one in-flight stream.
    pub async fn send<B, F>(
        &mut self,
        backend: &B,
        text: impl Into<String>,
        cancel: &CancellationToken,
        mut on_partial: F,
    ) -> TurnOutcome
    where
        B: ChatBackend + ?Sized,
        F: FnMut(&str),
    {
        self.history.push(Message::user(text));
        tracing::info!(
            event_name = "agent.turn.started",
            invoice_number = %self.draft.invoice_number,
            history_len = self.history.len(),
            "starting assistant turn"
        );

        let request = ChatRequest {
            system: system_instruction(&self.roster, self.settings.today, self.extractor.tag()),
            messages: self.history.clone(),
        };

        let mut visible = String::new();
        let streamed = tokio::time::timeout(
            self.settings.turn_timeout,
            stream_reply(backend, request, &self.extractor, cancel, &mut visible, &mut on_partial),
        )
        .await;

        match streamed {
            Ok(Ok(text)) => self.complete_turn(text),
            Ok(Err(StreamInterrupted { error: TransportError::Cancelled, .. })) => {
                tracing::info!(
                    event_name = "agent.turn.cancelled",
                    invoice_number = %self.draft.invoice_number,
                    "assistant turn cancelled; draft left unchanged"
                );
                TurnOutcome::Cancelled { partial_text: visible }
            }
            Ok(Err(StreamInterrupted { error, partial_text })) => {
                let partial_text = self.extractor.visible_text(&partial_text);
                self.fail_turn(error, partial_text)
            }
            Err(_) => self.fail_turn(TransportError::Timeout(self.settings.turn_timeout), visible),
        }
    }

    fn complete_turn(&mut self, text: String) -> TurnOutcome {
        let reply = self.extractor.clean_text(&text);

        let update = match self.extractor.extract(&text) {
            Extraction::None => DraftUpdate::Unchanged,
            Extraction::Malformed { .. } => DraftUpdate::MalformedBlock,
            Extraction::Parsed(data) => {
                let outcome = merge_extraction(&self.draft, &data, &self.roster);
                if let ClientMatch::Unmatched(name) = &outcome.report.client {
                    tracing::info!(
                        event_name = "agent.merge.client_unmatched",
                        client_name = %name,
                        roster_size = self.roster.len(),
                        "no client matched; keeping previous selection"
                    );
                }
                if !outcome.report.rejected_fields.is_empty() {
                    tracing::warn!(
                        event_name = "agent.merge.fields_rejected",
                        rejected = ?outcome.report.rejected_fields,
                        "invoice amounts out of range; keeping previous values"
                    );
                }
                tracing::debug!(
                    event_name = "agent.merge.applied",
                    changed = ?outcome.report.changed_fields,
                    "merged invoice block into draft"
                );
                self.draft = outcome.draft;
                DraftUpdate::Merged(outcome.report)
            }
        };

        self.history.push(Message::assistant(text));
        tracing::info!(
            event_name = "agent.turn.completed",
            invoice_number = %self.draft.invoice_number,
            draft_updated = matches!(update, DraftUpdate::Merged(_)),
            "assistant turn completed"
        );

        TurnOutcome::Replied { reply, update }
    }

    fn fail_turn(&mut self, error: TransportError, partial_text: String) -> TurnOutcome {
        tracing::warn!(
            event_name = "agent.turn.transport_failed",
            invoice_number = %self.draft.invoice_number,
            error = %error,
            "assistant turn failed; draft left unchanged"
        );

        let message = error.user_message().to_string();
        self.history.push(Message::assistant(message.clone()));
        TurnOutcome::Failed { error, message, partial_text }
    }
}

async fn stream_reply<B, F>(
    backend: &B,
    request: ChatRequest,
    extractor: &BlockExtractor,
    cancel: &CancellationToken,
    visible: &mut String,
    on_partial: &mut F,
) -> Result<String, StreamInterrupted>
where
    B: ChatBackend + ?Sized,
    F: FnMut(&str),
{
    let chunks = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(StreamInterrupted {
                error: TransportError::Cancelled,
                partial_text: String::new(),
            });
        }
        opened = backend.stream_chat(request) => opened
            .map_err(|error| StreamInterrupted { error, partial_text: String::new() })?,
    };

    accumulate(chunks, cancel, |partial| {
        let next = extractor.visible_text(partial);
        if next != *visible {
            *visible = next;
            on_partial(visible.as_str());
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::NaiveDate;
    use futures::stream::{self, StreamExt};
    use invoicey_core::drafting::{ClientMatch, DraftField};
    use invoicey_core::{
        Client, ClientId, ClientRoster, InvoiceDefaults, InvoiceDraft, InvoiceNumber, LineItemSlot,
    };
    use rust_decimal::Decimal;
    use tokio_util::sync::CancellationToken;

    use super::{ChatSession, DraftUpdate, Message, Role, SessionSettings, TurnOutcome};
    use crate::llm::{ChatBackend, ChatRequest, TextChunkStream, TransportError};

    /// Replays scripted replies, one per turn, split into small chunks.
    struct ScriptedBackend {
        replies: Mutex<Vec<&'static str>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedBackend {
        fn new(replies: &[&'static str]) -> Self {
            let mut replies = replies.to_vec();
            replies.reverse();
            Self { replies: Mutex::new(replies), requests: Mutex::new(Vec::new()) }
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn stream_chat(
            &self,
            request: ChatRequest,
        ) -> Result<TextChunkStream, TransportError> {
            self.requests.lock().expect("requests lock").push(request);
            let reply = self.replies.lock().expect("replies lock").pop().unwrap_or_default();
            let chunks = reply
                .as_bytes()
                .chunks(7)
                .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
                .collect::<Vec<_>>();
            Ok(stream::iter(chunks).boxed())
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl ChatBackend for FailingBackend {
        async fn stream_chat(
            &self,
            _request: ChatRequest,
        ) -> Result<TextChunkStream, TransportError> {
            Err(TransportError::Status { status: 503, body: "overloaded".to_string() })
        }
    }

    /// Sends some text, then errors mid-stream.
    struct BrokenStreamBackend;

    #[async_trait]
    impl ChatBackend for BrokenStreamBackend {
        async fn stream_chat(
            &self,
            _request: ChatRequest,
        ) -> Result<TextChunkStream, TransportError> {
            let items = vec![
                Ok(Bytes::from_static(b"Adding demo.\n```invoice-data\n{\"labor_items\":")),
                Err(TransportError::Request("connection reset".to_string())),
            ];
            Ok(stream::iter(items).boxed())
        }
    }

    /// Opens a stream that never yields.
    struct StalledBackend;

    #[async_trait]
    impl ChatBackend for StalledBackend {
        async fn stream_chat(
            &self,
            _request: ChatRequest,
        ) -> Result<TextChunkStream, TransportError> {
            Ok(stream::pending().boxed())
        }
    }

    fn client(name: &str) -> Client {
        Client {
            id: ClientId::new(),
            name: name.to_string(),
            email: "billing@example.com".to_string(),
            phone: None,
            address: "40 Birch Rd".to_string(),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).expect("valid date")
    }

    fn session(roster: ClientRoster) -> ChatSession {
        let draft = InvoiceDraft::new(InvoiceNumber(1), today(), &InvoiceDefaults::default());
        let settings = SessionSettings {
            block_tag: "invoice-data".to_string(),
            turn_timeout: Duration::from_secs(30),
            today: today(),
        };
        ChatSession::new(draft, Arc::new(roster), settings)
    }

    async fn send(session: &mut ChatSession, backend: &dyn ChatBackend, text: &str) -> TurnOutcome {
        session.send(backend, text, &CancellationToken::new(), |_| {}).await
    }

    #[tokio::test]
    async fn plain_reply_leaves_draft_unchanged() {
        let mut session = session(ClientRoster::default());
        let before = session.draft().clone();
        let backend = ScriptedBackend::new(&["What kind of remodel is it?"]);

        let outcome = send(&mut session, &backend, "I need an invoice").await;

        match outcome {
            TurnOutcome::Replied { reply, update } => {
                assert_eq!(reply, "What kind of remodel is it?");
                assert_eq!(update, DraftUpdate::Unchanged);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(session.draft(), &before);
        assert_eq!(
            session.history(),
            &[Message::user("I need an invoice"), Message::assistant("What kind of remodel is it?")]
        );
    }

    #[tokio::test]
    async fn labor_block_fills_first_slot_and_leaves_materials() {
        let mut session = session(ClientRoster::default());
        let backend = ScriptedBackend::new(&[
            "Added the demo.\n```invoice-data\n{\"labor_items\":[{\"description\":\"Demo\",\"amount\":500}]}\n```",
        ]);

        let outcome = send(&mut session, &backend, "Demo was $500").await;

        assert!(matches!(
            outcome,
            TurnOutcome::Replied { ref reply, update: DraftUpdate::Merged(ref report) }
                if reply == "Added the demo." && report.changed(DraftField::Labor)
        ));
        let draft = session.draft();
        assert_eq!(draft.labor.line1, LineItemSlot::new("Demo", Decimal::from(500)));
        assert_eq!(draft.labor.line2, LineItemSlot::default());
        assert!(draft.materials.is_empty());
    }

    #[tokio::test]
    async fn overflow_labor_items_fold_into_second_slot() {
        let mut session = session(ClientRoster::default());
        let backend = ScriptedBackend::new(&[
            "```invoice-data\n{\"labor_items\":[{\"description\":\"A\",\"amount\":100},{\"description\":\"B\",\"amount\":200},{\"description\":\"C\",\"amount\":300}]}\n```",
        ]);

        send(&mut session, &backend, "three jobs").await;

        let labor = &session.draft().labor;
        assert_eq!(labor.line1, LineItemSlot::new("A", Decimal::from(100)));
        assert_eq!(labor.line2, LineItemSlot::new("B; C", Decimal::from(500)));
    }

    #[tokio::test]
    async fn out_of_range_amounts_are_rejected_without_ending_the_turn() {
        let mut session = session(ClientRoster::default());
        let backend = ScriptedBackend::new(&[r#"Noted.
```invoice-data
{"labor_items": [{"description": "A", "amount": 1}, {"description": "B", "amount": 5e28},
 {"description": "C", "amount": 5e28}],
 "material_items": [{"description": "Tile", "amount": 300}], "tax_rate": 1e27}
```"#]);

        let outcome = send(&mut session, &backend, "huge job").await;

        let TurnOutcome::Replied { reply, update: DraftUpdate::Merged(report) } = outcome else {
            panic!("expected a merged reply");
        };
        assert_eq!(reply, "Noted.");
        assert!(report.rejected(DraftField::Labor));
        assert!(report.rejected(DraftField::TaxRate));
        assert!(report.changed(DraftField::Materials));

        let draft = session.draft();
        assert!(draft.labor.is_empty());
        assert_eq!(draft.tax_rate, Decimal::ZERO);
        assert_eq!(draft.totals().map(|totals| totals.total), Ok(Decimal::from(300)));
    }

    #[tokio::test]
    async fn partial_client_name_resolves_against_roster() {
        let john = client("Johnathan Miller");
        let mut session = session(ClientRoster::new(vec![client("Ana Ruiz"), john.clone()]));
        let backend =
            ScriptedBackend::new(&["Billing John.\n```invoice-data\n{\"client_name\":\"john\"}\n```"]);

        let outcome = send(&mut session, &backend, "It's for john").await;

        assert_eq!(session.draft().client_id, Some(john.id));
        assert!(matches!(
            outcome,
            TurnOutcome::Replied { update: DraftUpdate::Merged(ref report), .. }
                if report.client == ClientMatch::Matched(john.id)
        ));
    }

    #[tokio::test]
    async fn unmatched_client_keeps_previous_selection() {
        let ana = client("Ana Ruiz");
        let mut session = session(ClientRoster::new(vec![ana.clone()]));
        session.draft_mut().client_id = Some(ana.id);
        let backend = ScriptedBackend::new(&["```invoice-data\n{\"client_name\":\"Zed\"}\n```"]);

        let outcome = send(&mut session, &backend, "actually Zed").await;

        assert_eq!(session.draft().client_id, Some(ana.id));
        assert!(matches!(
            outcome,
            TurnOutcome::Replied { update: DraftUpdate::Merged(ref report), .. }
                if report.client == ClientMatch::Unmatched("Zed".to_string())
        ));
    }

    #[tokio::test]
    async fn malformed_block_is_conversation_only() {
        let mut session = session(ClientRoster::default());
        let before = session.draft().clone();
        let backend =
            ScriptedBackend::new(&["All set!\n```invoice-data\n{\"labor_items\": [oops]}\n```"]);

        let outcome = send(&mut session, &backend, "add it").await;

        match outcome {
            TurnOutcome::Replied { reply, update } => {
                assert_eq!(reply, "All set!");
                assert_eq!(update, DraftUpdate::MalformedBlock);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(session.draft(), &before);
    }

    #[tokio::test]
    async fn partial_updates_never_show_the_block() {
        let mut session = session(ClientRoster::default());
        let backend = ScriptedBackend::new(&[
            "Recording tile work now.\n```invoice-data\n{\"material_items\":[{\"description\":\"Tile\",\"amount\":320}]}\n```",
        ]);
        let mut partials = Vec::new();

        session
            .send(&backend, "tile was 320", &CancellationToken::new(), |partial| {
                partials.push(partial.to_string())
            })
            .await;

        assert!(!partials.is_empty());
        assert!(partials.iter().all(|partial| !partial.contains('`') && !partial.contains('{')));
        assert_eq!(partials.last().map(String::as_str), Some("Recording tile work now."));
        assert_eq!(session.draft().materials.total(), Some(Decimal::from(320)));
    }

    #[tokio::test]
    async fn request_carries_history_and_instruction() {
        let mut session = session(ClientRoster::new(vec![client("Johnathan Miller")]));
        let backend = ScriptedBackend::new(&["Who is the client?", "Got it."]);

        send(&mut session, &backend, "Kitchen job").await;
        send(&mut session, &backend, "Johnathan").await;

        let requests = backend.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].system.contains("Johnathan Miller"));
        assert!(requests[1].system.contains("2026-10-19"));
        let roles = requests[1].messages.iter().map(|message| message.role).collect::<Vec<_>>();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
    }

    #[tokio::test]
    async fn repeating_the_same_block_is_idempotent() {
        let block = "```invoice-data\n{\"labor_items\":[{\"description\":\"Paint\",\"amount\":450}],\"tax_rate\":0}\n```";
        let mut session = session(ClientRoster::default());
        session.draft_mut().tax_rate = Decimal::from(7);
        let backend = ScriptedBackend::new(&[block, block]);

        send(&mut session, &backend, "paint").await;
        let once = session.draft().clone();
        let outcome = send(&mut session, &backend, "same again").await;

        assert_eq!(session.draft(), &once);
        assert_eq!(once.tax_rate, Decimal::ZERO);
        assert!(matches!(
            outcome,
            TurnOutcome::Replied { update: DraftUpdate::Merged(ref report), .. }
                if report.changed_fields.is_empty()
        ));
    }

    #[tokio::test]
    async fn connect_failure_appends_error_message() {
        let mut session = session(ClientRoster::default());
        let before = session.draft().clone();

        let outcome = send(&mut session, &FailingBackend, "hello").await;

        let TurnOutcome::Failed { error, message, partial_text } = outcome else {
            panic!("expected failure");
        };
        assert!(matches!(error, TransportError::Status { status: 503, .. }));
        assert_eq!(partial_text, "");
        assert_eq!(session.history().last(), Some(&Message::assistant(message)));
        assert_eq!(session.draft(), &before);
    }

    #[tokio::test]
    async fn mid_stream_failure_never_merges_partial_block() {
        let mut session = session(ClientRoster::default());
        let before = session.draft().clone();

        let outcome = send(&mut session, &BrokenStreamBackend, "demo").await;

        let TurnOutcome::Failed { partial_text, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(partial_text, "Adding demo.");
        assert_eq!(session.draft(), &before);
        assert_eq!(session.history().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_times_out() {
        let mut session = session(ClientRoster::default());

        let outcome = send(&mut session, &StalledBackend, "hello?").await;

        let TurnOutcome::Failed { error, message, .. } = outcome else {
            panic!("expected timeout");
        };
        assert!(matches!(
            error,
            TransportError::Timeout(timeout) if timeout == Duration::from_secs(30)
        ));
        assert!(message.contains("took too long"));
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history()[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn cancelled_turn_appends_nothing() {
        let mut session = session(ClientRoster::default());
        let before = session.draft().clone();
        let backend = ScriptedBackend::new(&["```invoice-data\n{\"notes\":\"never\"}\n```"]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = session.send(&backend, "stop", &cancel, |_| {}).await;

        assert!(matches!(outcome, TurnOutcome::Cancelled { .. }));
        assert_eq!(session.history(), &[Message::user("stop")]);
        assert_eq!(session.draft(), &before);
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn transcript_hides_blocks_but_history_keeps_them() {
        let mut session = session(ClientRoster::default());
        let backend =
            ScriptedBackend::new(&["Noted.\n```invoice-data\n{\"notes\":\"Side gate code 4411\"}\n```"]);

        send(&mut session, &backend, "gate code is 4411").await;

        assert!(session.history()[1].content.contains("```invoice-data"));
        assert_eq!(session.transcript()[1], Message::assistant("Noted."));
        assert_eq!(session.draft().notes, "Side gate code 4411");
    }
}
