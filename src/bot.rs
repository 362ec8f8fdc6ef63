use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{AccessControl, Zone};
use crate::conversation::{Action, ConversationController, Outcome, TIMEOUT_NOTICE};
use crate::form::{Submission, SubmissionRecord};
use crate::platform::{
    Button, ChatRef, ChatTransport, EventKind, IncomingEvent, Keyboard, Reply, Requester,
};
use crate::store::{ExportFilter, StoreError, SubmissionStore, RECALL_LIMIT};

const MENU_TEXT: &str =
    "Hi! I can record a new request or recall past submissions. Choose an option:";
const HELP_TEXT: &str = "Commands:\n\
     /start - Begin a new request\n\
     /menu - Show all options\n\
     /history - Your last submissions\n\
     /search - Search submissions by brand name\n\
     /cancel - Cancel the current form";

/// Features only listed admins may use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdminFeature {
    Export,
    Dashboard,
    Manager,
}

impl AdminFeature {
    fn refusal(self) -> &'static str {
        match self {
            AdminFeature::Export => "Sorry, only admins can export CSV.",
            AdminFeature::Dashboard => "Sorry, only admins can access the dashboard link.",
            AdminFeature::Manager => "Sorry, only admins can access the manager view.",
        }
    }
}

/// Shared application state
pub struct App {
    controller: ConversationController,
    store: SubmissionStore,
    transport: Arc<dyn ChatTransport>,
    access: Arc<AccessControl>,
    zone: Zone,
}

impl App {
    pub fn new(
        controller: ConversationController,
        store: SubmissionStore,
        transport: Arc<dyn ChatTransport>,
        access: Arc<AccessControl>,
        zone: Zone,
    ) -> Self {
        Self {
            controller,
            store,
            transport,
            access,
            zone,
        }
    }

    /// Route one incoming event. Store work runs on its own task, whose
    /// handle is returned so callers can wait for it.
    pub async fn handle(self: &Arc<Self>, event: IncomingEvent) -> Option<JoinHandle<()>> {
        let IncomingEvent {
            requester,
            chat,
            kind,
        } = event;
        let identity = requester.identity();

        match kind {
            EventKind::Command(command) => {
                info!("Command /{} from {}", command, identity);
                self.handle_command(&requester, &identity, chat, &command)
                    .await
            }
            EventKind::Text(text) => {
                let outcome = self.controller.handle_text(&identity, chat, &text).await;
                self.finish(&identity, chat, None, outcome).await
            }
            EventKind::Callback {
                id,
                data,
                message_id,
            } => {
                if let Err(e) = self.transport.answer_callback(&id).await {
                    warn!("Failed to answer callback from {}: {}", identity, e);
                }
                match data.strip_prefix("action:") {
                    Some(action) => {
                        self.handle_menu(&requester, &identity, chat, action).await
                    }
                    None => {
                        let outcome = self.controller.handle_choice(&identity, chat, &data).await;
                        self.finish(&identity, chat, message_id, outcome).await
                    }
                }
            }
        }
    }

    async fn handle_command(
        self: &Arc<Self>,
        requester: &Requester,
        identity: &str,
        chat: ChatRef,
        command: &str,
    ) -> Option<JoinHandle<()>> {
        let outcome = match command {
            "start" => self.controller.start(identity, chat).await,
            "menu" => {
                self.send(chat, &self.menu(requester)).await;
                return None;
            }
            "cancel" => self.controller.cancel(identity, chat).await,
            "history" => Outcome {
                replies: Vec::new(),
                action: Some(Action::RecallLast),
            },
            "search" => self.controller.begin_search(identity, chat).await,
            "export" => match self.require_admin(requester, chat, AdminFeature::Export).await {
                true => self.controller.begin_export(identity, chat).await,
                false => return None,
            },
            "dashboard" => {
                if self.require_admin(requester, chat, AdminFeature::Dashboard).await {
                    self.send_dashboard(chat).await;
                }
                return None;
            }
            "manager" => {
                if !self.require_admin(requester, chat, AdminFeature::Manager).await {
                    return None;
                }
                return Some(self.spawn_manager_view(chat));
            }
            "help" => {
                self.send(chat, &Reply::text(HELP_TEXT)).await;
                return None;
            }
            other => {
                info!("Unknown command /{} from {}", other, identity);
                self.send(chat, &Reply::text(format!("Unknown command.\n\n{}", HELP_TEXT)))
                    .await;
                return None;
            }
        };
        self.finish(identity, chat, None, outcome).await
    }

    async fn handle_menu(
        self: &Arc<Self>,
        requester: &Requester,
        identity: &str,
        chat: ChatRef,
        action: &str,
    ) -> Option<JoinHandle<()>> {
        let outcome = match action {
            "new" => self.controller.start(identity, chat).await,
            "recall" => self.controller.begin_recall(identity, chat).await,
            "export" => match self.require_admin(requester, chat, AdminFeature::Export).await {
                true => self.controller.begin_export(identity, chat).await,
                false => return None,
            },
            "dashboard" => {
                if self.require_admin(requester, chat, AdminFeature::Dashboard).await {
                    self.send_dashboard(chat).await;
                }
                return None;
            }
            "manager" => {
                if !self.require_admin(requester, chat, AdminFeature::Manager).await {
                    return None;
                }
                self.send(chat, &Reply::text("Preparing manager view...")).await;
                return Some(self.spawn_manager_view(chat));
            }
            other => {
                warn!("Unknown menu action '{}' from {}", other, identity);
                self.send(chat, &Reply::text("Sorry, I didn't understand that option."))
                    .await;
                return None;
            }
        };
        self.finish(identity, chat, None, outcome).await
    }

    fn menu(&self, requester: &Requester) -> Reply {
        let mut buttons = vec![
            Button::new("New Request", "action:new"),
            Button::new("Recall Submissions", "action:recall"),
        ];
        if self.access.is_admin(requester.username.as_deref()) {
            buttons.push(Button::new("Export CSV", "action:export"));
            buttons.push(Button::new("Dashboard Link", "action:dashboard"));
            buttons.push(Button::new("Manager View", "action:manager"));
        }
        Reply::with_keyboard(MENU_TEXT, Keyboard::column(buttons))
    }

    /// Send the refusal and return false for non-admins
    async fn require_admin(
        &self,
        requester: &Requester,
        chat: ChatRef,
        feature: AdminFeature,
    ) -> bool {
        if self.access.is_admin(requester.username.as_deref()) {
            return true;
        }
        info!(
            "Refused {:?} for non-admin {}",
            feature,
            requester.identity()
        );
        self.send(chat, &Reply::text(feature.refusal())).await;
        false
    }

    async fn send_dashboard(&self, chat: ChatRef) {
        let text = match self.store.dashboard_link() {
            Some(url) => format!("Dashboard link:\n{}", url),
            None => "No dashboard link is configured.".to_string(),
        };
        self.send(chat, &Reply::text(text)).await;
    }

    fn spawn_manager_view(self: &Arc<Self>, chat: ChatRef) -> JoinHandle<()> {
        let app = Arc::clone(self);
        tokio::spawn(async move {
            let now = app.zone.now();
            match app.store.manager_summary(now).await {
                Ok(summary) => app.send(chat, &Reply::text(summary.render())).await,
                Err(e) => app.report_store_error(chat, "manager view", &e).await,
            }
        })
    }

    /// Deliver the controller's replies, then start its action if any
    async fn finish(
        self: &Arc<Self>,
        identity: &str,
        chat: ChatRef,
        origin: Option<i32>,
        outcome: Outcome,
    ) -> Option<JoinHandle<()>> {
        for reply in &outcome.replies {
            self.deliver(chat, origin, reply).await;
        }

        let action = outcome.action?;
        let app = Arc::clone(self);
        let identity = identity.to_string();
        Some(tokio::spawn(async move {
            app.run_action(&identity, chat, action).await;
        }))
    }

    async fn run_action(&self, identity: &str, chat: ChatRef, action: Action) {
        match action {
            Action::Submit(submission) => self.submit(chat, submission).await,
            Action::RecallLast => self.recall(identity, chat).await,
            Action::SearchBrand(query) => self.search(chat, &query).await,
            Action::Export(filter) => self.export(chat, &filter).await,
        }
    }

    async fn submit(&self, chat: ChatRef, submission: Submission) {
        if let Err(e) = self.store.append(&submission).await {
            self.report_store_error(chat, "append", &e).await;
            return;
        }

        let notification = submission.notification();
        let recorded = format!(
            "Your request has been recorded.\n\n{}",
            SubmissionRecord::from(&submission).summary()
        );
        self.send(chat, &Reply::text(recorded)).await;
        self.send(chat, &Reply::text(notification.clone())).await;

        let targets = self.access.notify_targets();
        let results = join_all(
            targets
                .iter()
                .map(|target| self.transport.notify(target, &notification)),
        )
        .await;
        for (target, result) in targets.iter().zip(results) {
            if let Err(e) = result {
                error!("Failed to notify {:?}: {}", target, e);
            }
        }
    }

    async fn recall(&self, identity: &str, chat: ChatRef) {
        let records = match self.store.recall_last(identity, RECALL_LIMIT).await {
            Ok(records) => records,
            Err(e) => return self.report_store_error(chat, "recall", &e).await,
        };

        let text = if records.is_empty() {
            "No submissions found for your username.".to_string()
        } else {
            let lines: Vec<String> = records
                .iter()
                .map(|r| format!("- {} | {} | {}", r.timestamp, r.brand_name, r.air_date))
                .collect();
            format!("Your last submissions:\n{}", lines.join("\n"))
        };
        self.send(chat, &Reply::text(text)).await;
    }

    async fn search(&self, chat: ChatRef, query: &str) {
        let matches = match self.store.search_by_brand(query).await {
            Ok(matches) => matches,
            Err(e) => return self.report_store_error(chat, "search", &e).await,
        };

        let text = if matches.is_empty() {
            "No submissions found for that brand name.".to_string()
        } else {
            let skip = matches.len().saturating_sub(RECALL_LIMIT);
            let lines: Vec<String> = matches[skip..]
                .iter()
                .map(|r| format!("- {} | {} | {}", r.timestamp, r.brand_name, r.requester))
                .collect();
            format!("Matches:\n{}", lines.join("\n"))
        };
        self.send(chat, &Reply::text(text)).await;
    }

    async fn export(&self, chat: ChatRef, filter: &ExportFilter) {
        let result = match filter {
            ExportFilter::All => self.store.export_all().await,
            filter => self.store.export(filter).await,
        };
        let export = match result {
            Ok(export) => export,
            Err(e) => return self.report_store_error(chat, "export", &e).await,
        };

        if export.rows == 0 {
            self.send(chat, &Reply::text("No submissions found to export."))
                .await;
            return;
        }

        let file_name = format!(
            "request-submissions-{}.csv",
            self.zone.now().format("%Y%m%d-%H%M%S")
        );
        info!("Exporting {} rows as {}", export.rows, file_name);
        if let Err(e) = self
            .transport
            .send_document(chat, &file_name, export.content.into_bytes())
            .await
        {
            error!("Failed to send export {}: {}", file_name, e);
            self.send(chat, &Reply::text("Sorry, I couldn't send the export file."))
                .await;
        }
    }

    async fn report_store_error(&self, chat: ChatRef, operation: &str, e: &StoreError) {
        error!("Store {} failed: {}", operation, e);
        self.send(chat, &Reply::text(e.user_message())).await;
    }

    /// Edit the pressed message when asked to, falling back to a new one
    async fn deliver(&self, chat: ChatRef, origin: Option<i32>, reply: &Reply) {
        if let (true, Some(message_id)) = (reply.edit_origin, origin) {
            match self.transport.edit(chat, message_id, reply).await {
                Ok(()) => return,
                Err(e) => warn!("Could not edit message {}: {}", message_id, e),
            }
        }
        self.send(chat, reply).await;
    }

    async fn send(&self, chat: ChatRef, reply: &Reply) {
        if let Err(e) = self.transport.send(chat, reply).await {
            error!("Failed to send reply to chat {}: {}", chat.0, e);
        }
    }

    pub async fn active_conversations(&self) -> usize {
        self.controller.active_count().await
    }

    /// Reset timed-out conversations and tell their chats
    pub async fn sweep_sessions(&self) -> usize {
        let expired = self.controller.sweep_expired().await;
        for chat in &expired {
            self.send(*chat, &Reply::text(TIMEOUT_NOTICE)).await;
        }
        if !expired.is_empty() {
            info!("Timed out {} conversation(s)", expired.len());
        }
        expired.len()
    }
}
