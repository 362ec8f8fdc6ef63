use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::config::Zone;
use crate::form::{DetailField, Platform, PlatformMode, Submission, SubmissionRecord};
use crate::platform::{Button, ChatRef, Keyboard, Reply};
use crate::store::ExportFilter;

pub const TIMEOUT_NOTICE: &str =
    "Your request timed out after a period of inactivity. Use /start to begin again.";
const IDLE_HINT: &str = "Use /start to begin a new request or /menu for more options.";

/// Where a requester currently is in a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Idle,
    AwaitingMode,
    AwaitingPlatforms,
    AwaitingOtherPlatforms,
    AwaitingBrand,
    AwaitingDetails(DetailField),
    Confirming,
    AwaitingRecallChoice,
    AwaitingSearchQuery,
    AwaitingExportChoice,
    AwaitingExportStart,
    AwaitingExportEnd { start: NaiveDate },
    AwaitingExportRequester,
}

/// Values collected so far for the in-progress submission
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Draft {
    pub platform_mode: Option<PlatformMode>,
    pub platforms: Vec<Platform>,
    pub other_platforms: Option<String>,
    pub brand_name: Option<String>,
    pub creator_name: Option<String>,
    pub room: Option<String>,
    pub air_date: Option<String>,
    pub camera_requirements: Option<String>,
    pub stage_design: Option<String>,
    pub other_technical: Option<String>,
}

impl Draft {
    fn detail_mut(&mut self, field: DetailField) -> &mut Option<String> {
        match field {
            DetailField::CreatorName => &mut self.creator_name,
            DetailField::Room => &mut self.room,
            DetailField::AirDate => &mut self.air_date,
            DetailField::CameraRequirements => &mut self.camera_requirements,
            DetailField::StageDesign => &mut self.stage_design,
            DetailField::OtherTechnical => &mut self.other_technical,
        }
    }

    fn wants_other_platforms(&self) -> bool {
        self.platforms.contains(&Platform::Others)
    }

    /// Toggle membership, keeping platforms in menu order.
    fn toggle_platform(&mut self, platform: Platform) {
        if let Some(pos) = self.platforms.iter().position(|p| *p == platform) {
            self.platforms.remove(pos);
        } else {
            self.platforms.push(platform);
            self.platforms
                .sort_by_key(|p| Platform::ALL.iter().position(|a| a == p));
        }
    }

    fn preview(&self) -> SubmissionRecord {
        let text = |v: &Option<String>| v.clone().unwrap_or_default();
        SubmissionRecord {
            platform_mode: self
                .platform_mode
                .map(|m| m.label().to_string())
                .unwrap_or_default(),
            platforms: crate::form::join_platforms(&self.platforms),
            other_platforms: text(&self.other_platforms),
            brand_name: text(&self.brand_name),
            creator_name: text(&self.creator_name),
            room: text(&self.room),
            air_date: text(&self.air_date),
            camera_requirements: text(&self.camera_requirements),
            stage_design: text(&self.stage_design),
            other_technical: text(&self.other_technical),
            ..Default::default()
        }
    }

    /// `None` unless every required field is present
    fn build(&self, requester: &str, zone: Zone) -> Option<Submission> {
        if self.platforms.is_empty() {
            return None;
        }
        let other_platforms = if self.wants_other_platforms() {
            self.other_platforms.clone()?
        } else {
            String::new()
        };
        Some(Submission {
            requester: requester.to_string(),
            submitted_at: zone.now(),
            platform_mode: self.platform_mode?,
            platforms: self.platforms.clone(),
            other_platforms,
            brand_name: self.brand_name.clone()?,
            creator_name: self.creator_name.clone()?,
            room: self.room.clone()?,
            air_date: self.air_date.clone()?,
            camera_requirements: self.camera_requirements.clone()?,
            stage_design: self.stage_design.clone()?,
            other_technical: self.other_technical.clone()?,
        })
    }
}

/// Work the caller must carry out after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Submit(Submission),
    RecallLast,
    SearchBrand(String),
    Export(ExportFilter),
}

#[derive(Debug, Default)]
pub struct Outcome {
    pub replies: Vec<Reply>,
    pub action: Option<Action>,
}

impl Outcome {
    fn reply(reply: Reply) -> Self {
        Self {
            replies: vec![reply],
            action: None,
        }
    }

    fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum Input<'a> {
    Start,
    Cancel,
    BeginRecall,
    BeginSearch,
    BeginExport,
    Text(&'a str),
    Choice(&'a str),
}

impl Input<'_> {
    fn is_step_input(&self) -> bool {
        matches!(self, Input::Text(_) | Input::Choice(_))
    }
}

/// A parsed button payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Choice {
    Mode(PlatformMode),
    Platform(Platform),
    PlatformsDone,
    Confirm,
    Restart,
    Discard,
    RecallHistory,
    RecallSearch,
    ExportAll,
    ExportDate,
    ExportRequester,
}

fn parse_choice(payload: &str) -> Option<Choice> {
    let (kind, value) = payload.split_once(':')?;
    let choice = match (kind, value) {
        ("mode", "single") => Choice::Mode(PlatformMode::Single),
        ("mode", "multi") => Choice::Mode(PlatformMode::Multi),
        ("platform", "done") => Choice::PlatformsDone,
        ("platform", label) => Choice::Platform(Platform::from_label(label)?),
        ("confirm", "yes") => Choice::Confirm,
        ("confirm", "restart") => Choice::Restart,
        ("confirm", "no") => Choice::Discard,
        ("recall", "history") => Choice::RecallHistory,
        ("recall", "search") => Choice::RecallSearch,
        ("export", "all") => Choice::ExportAll,
        ("export", "date") => Choice::ExportDate,
        ("export", "requester") => Choice::ExportRequester,
        _ => return None,
    };
    Some(choice)
}

/// Why a step input was not accepted. Never leaves this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    ExpectedButton,
    ExpectedText,
    Blank,
    UnknownChoice,
    StaleChoice,
    NoPlatformSelected,
    BadDate,
    EndBeforeStart,
}

impl Rejection {
    fn message(self) -> &'static str {
        match self {
            Rejection::ExpectedButton => "Please choose one of the buttons below.",
            Rejection::ExpectedText => "Please type your answer.",
            Rejection::Blank => "This field can't be empty.",
            Rejection::UnknownChoice => "Sorry, I didn't understand that option.",
            Rejection::StaleChoice => "That button is no longer active.",
            Rejection::NoPlatformSelected => "Select at least one platform before pressing Done.",
            Rejection::BadDate => "Invalid date format.",
            Rejection::EndBeforeStart => "End date must be after start date.",
        }
    }
}

struct Session {
    step: Step,
    draft: Draft,
    chat: ChatRef,
    last_activity: Instant,
}

impl Session {
    fn new(chat: ChatRef, now: Instant) -> Self {
        Self {
            step: Step::Idle,
            draft: Draft::default(),
            chat,
            last_activity: now,
        }
    }

    fn reset(&mut self) {
        self.step = Step::Idle;
        self.draft = Draft::default();
    }

    fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.step != Step::Idle && now.saturating_duration_since(self.last_activity) > timeout
    }
}

/// Drives each requester through the request form and the menu side flows.
///
/// Sessions live in a map keyed by requester identity. The map lock is only
/// held for lookup; transitions run under the per-requester lock so unrelated
/// requesters never wait on each other.
pub struct ConversationController {
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
    timeout: Duration,
    zone: Zone,
}

impl ConversationController {
    pub fn new(timeout: Duration, zone: Zone) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            timeout,
            zone,
        }
    }

    pub async fn start(&self, requester: &str, chat: ChatRef) -> Outcome {
        self.apply(requester, chat, Input::Start).await
    }

    pub async fn cancel(&self, requester: &str, chat: ChatRef) -> Outcome {
        self.apply(requester, chat, Input::Cancel).await
    }

    pub async fn begin_recall(&self, requester: &str, chat: ChatRef) -> Outcome {
        self.apply(requester, chat, Input::BeginRecall).await
    }

    pub async fn begin_search(&self, requester: &str, chat: ChatRef) -> Outcome {
        self.apply(requester, chat, Input::BeginSearch).await
    }

    /// Caller must have checked admin rights.
    pub async fn begin_export(&self, requester: &str, chat: ChatRef) -> Outcome {
        self.apply(requester, chat, Input::BeginExport).await
    }

    pub async fn handle_text(&self, requester: &str, chat: ChatRef, text: &str) -> Outcome {
        self.apply(requester, chat, Input::Text(text)).await
    }

    pub async fn handle_choice(&self, requester: &str, chat: ChatRef, payload: &str) -> Outcome {
        self.apply(requester, chat, Input::Choice(payload)).await
    }

    /// Current step and draft, if the requester has a session
    #[cfg(test)]
    async fn snapshot(&self, requester: &str) -> Option<(Step, Draft)> {
        let session = self.sessions.lock().await.get(requester).cloned()?;
        let session = session.lock().await;
        Some((session.step, session.draft.clone()))
    }

    /// Sessions somewhere in a flow. Sessions busy handling an event count too.
    pub async fn active_count(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .filter(|entry| match entry.try_lock() {
                Ok(session) => session.step != Step::Idle,
                Err(_) => true,
            })
            .count()
    }

    /// Reset timed-out sessions and drop idle ones nobody is using.
    /// Returns the chats that should get a timeout notice.
    pub async fn sweep_expired(&self) -> Vec<ChatRef> {
        self.sweep_expired_at(Instant::now()).await
    }

    async fn sweep_expired_at(&self, now: Instant) -> Vec<ChatRef> {
        let mut expired = Vec::new();
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|requester, entry| {
            // Busy sessions are skipped; their next event checks expiry itself.
            let Ok(mut session) = entry.try_lock() else {
                return true;
            };
            if session.is_expired(now, self.timeout) {
                debug!("Conversation for {} timed out", requester);
                session.reset();
                expired.push(session.chat);
            }
            // Clones are only handed out under the map lock, so a count of
            // one means no handler can be about to use this entry.
            !(session.step == Step::Idle && Arc::strong_count(entry) == 1)
        });
        expired
    }

    async fn session_for(&self, requester: &str, chat: ChatRef) -> Arc<Mutex<Session>> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(requester.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(chat, Instant::now()))))
            .clone()
    }

    async fn apply(&self, requester: &str, chat: ChatRef, input: Input<'_>) -> Outcome {
        self.apply_at(requester, chat, input, Instant::now()).await
    }

    async fn apply_at(
        &self,
        requester: &str,
        chat: ChatRef,
        input: Input<'_>,
        now: Instant,
    ) -> Outcome {
        let entry = self.session_for(requester, chat).await;
        let mut session = entry.lock().await;

        if session.is_expired(now, self.timeout) {
            debug!("Conversation for {} expired before this event", requester);
            session.reset();
            session.last_activity = now;
            if input.is_step_input() {
                return Outcome::reply(Reply::text(TIMEOUT_NOTICE));
            }
        }

        session.chat = chat;
        session.last_activity = now;
        self.transition(&mut session, requester, input)
    }

    fn transition(&self, session: &mut Session, requester: &str, input: Input<'_>) -> Outcome {
        match input {
            Input::Start => {
                session.reset();
                session.step = Step::AwaitingMode;
                Outcome::reply(prompt(session.step, &session.draft))
            }
            Input::Cancel => {
                session.reset();
                Outcome::reply(Reply::text("Canceled. Use /start to begin again."))
            }
            Input::BeginRecall => {
                session.reset();
                session.step = Step::AwaitingRecallChoice;
                Outcome::reply(prompt(session.step, &session.draft))
            }
            Input::BeginSearch => {
                session.reset();
                session.step = Step::AwaitingSearchQuery;
                Outcome::reply(prompt(session.step, &session.draft))
            }
            Input::BeginExport => {
                session.reset();
                session.step = Step::AwaitingExportChoice;
                Outcome::reply(prompt(session.step, &session.draft))
            }
            Input::Text(text) => match self.accept_text(session, text) {
                Ok(outcome) => outcome,
                Err(rejection) => reprompt(session, rejection),
            },
            Input::Choice(payload) => match self.accept_choice(session, requester, payload) {
                Ok(outcome) => outcome,
                Err(rejection) => reprompt(session, rejection),
            },
        }
    }

    fn accept_text(&self, session: &mut Session, text: &str) -> Result<Outcome, Rejection> {
        let value = text.trim();
        let step = session.step;
        match step {
            Step::Idle => Ok(Outcome::reply(Reply::text(IDLE_HINT))),
            Step::AwaitingMode
            | Step::AwaitingPlatforms
            | Step::Confirming
            | Step::AwaitingRecallChoice
            | Step::AwaitingExportChoice => Err(Rejection::ExpectedButton),
            Step::AwaitingOtherPlatforms => {
                session.draft.other_platforms = Some(non_blank(value)?);
                Ok(advance(session, Step::AwaitingBrand))
            }
            Step::AwaitingBrand => {
                session.draft.brand_name = Some(non_blank(value)?);
                Ok(advance(session, Step::AwaitingDetails(DetailField::FIRST)))
            }
            Step::AwaitingDetails(field) => {
                let value = non_blank(value)?;
                *session.draft.detail_mut(field) = Some(value);
                let next = field
                    .next()
                    .map(Step::AwaitingDetails)
                    .unwrap_or(Step::Confirming);
                Ok(advance(session, next))
            }
            Step::AwaitingSearchQuery => {
                let query = non_blank(value)?;
                session.reset();
                Ok(Outcome::default().with_action(Action::SearchBrand(query)))
            }
            Step::AwaitingExportStart => {
                let start = parse_date(value)?;
                Ok(advance(session, Step::AwaitingExportEnd { start }))
            }
            Step::AwaitingExportEnd { start } => {
                let end = parse_date(value)?;
                if end < start {
                    return Err(Rejection::EndBeforeStart);
                }
                session.reset();
                Ok(Outcome::reply(Reply::text("Preparing CSV export..."))
                    .with_action(Action::Export(ExportFilter::DateRange { start, end })))
            }
            Step::AwaitingExportRequester => {
                let name = non_blank(value.trim_start_matches('@'))?;
                session.reset();
                Ok(Outcome::reply(Reply::text("Preparing CSV export..."))
                    .with_action(Action::Export(ExportFilter::Requester(name))))
            }
        }
    }

    fn accept_choice(
        &self,
        session: &mut Session,
        requester: &str,
        payload: &str,
    ) -> Result<Outcome, Rejection> {
        let choice = parse_choice(payload).ok_or(Rejection::UnknownChoice)?;
        let step = session.step;

        match (step, choice) {
            (Step::Idle, _) => Ok(Outcome::reply(Reply::text(
                "This form is no longer active. Use /start to begin a new request.",
            ))),

            (Step::AwaitingMode, Choice::Mode(mode)) => {
                session.draft.platform_mode = Some(mode);
                session.draft.platforms.clear();
                Ok(advance_in_place(session, Step::AwaitingPlatforms))
            }

            (Step::AwaitingPlatforms, Choice::Platform(platform)) => {
                match session.draft.platform_mode {
                    Some(PlatformMode::Multi) => {
                        session.draft.toggle_platform(platform);
                        Ok(Outcome::reply(prompt(step, &session.draft).editing()))
                    }
                    _ => {
                        session.draft.platforms = vec![platform];
                        Ok(finish_platforms(session))
                    }
                }
            }
            (Step::AwaitingPlatforms, Choice::PlatformsDone) => {
                if session.draft.platforms.is_empty() {
                    return Err(Rejection::NoPlatformSelected);
                }
                Ok(finish_platforms(session))
            }

            (Step::Confirming, Choice::Confirm) => match session.draft.build(requester, self.zone) {
                Some(submission) => {
                    session.reset();
                    Ok(Outcome::reply(Reply::text("Saving your request...").editing())
                        .with_action(Action::Submit(submission)))
                }
                None => {
                    error!("Draft for {} reached confirmation incomplete", requester);
                    session.reset();
                    Ok(Outcome::reply(Reply::text(
                        "Something went wrong with this form. Use /start to begin again.",
                    )))
                }
            },
            (Step::Confirming, Choice::Restart) => {
                session.draft = Draft::default();
                Ok(advance_in_place(session, Step::AwaitingMode))
            }
            (Step::Confirming, Choice::Discard) => {
                session.reset();
                Ok(Outcome::reply(
                    Reply::text("Submission canceled. Use /start to begin again.").editing(),
                ))
            }

            (Step::AwaitingRecallChoice, Choice::RecallHistory) => {
                session.reset();
                Ok(Outcome::default().with_action(Action::RecallLast))
            }
            (Step::AwaitingRecallChoice, Choice::RecallSearch) => {
                Ok(advance_in_place(session, Step::AwaitingSearchQuery))
            }

            (Step::AwaitingExportChoice, Choice::ExportAll) => {
                session.reset();
                Ok(
                    Outcome::reply(Reply::text("Preparing CSV export...").editing())
                        .with_action(Action::Export(ExportFilter::All)),
                )
            }
            (Step::AwaitingExportChoice, Choice::ExportDate) => {
                Ok(advance_in_place(session, Step::AwaitingExportStart))
            }
            (Step::AwaitingExportChoice, Choice::ExportRequester) => {
                Ok(advance_in_place(session, Step::AwaitingExportRequester))
            }

            (
                Step::AwaitingOtherPlatforms
                | Step::AwaitingBrand
                | Step::AwaitingDetails(_)
                | Step::AwaitingSearchQuery
                | Step::AwaitingExportStart
                | Step::AwaitingExportEnd { .. }
                | Step::AwaitingExportRequester,
                _,
            ) => Err(Rejection::ExpectedText),

            _ => Err(Rejection::StaleChoice),
        }
    }
}

fn non_blank(value: &str) -> Result<String, Rejection> {
    let value = value.trim();
    if value.is_empty() {
        Err(Rejection::Blank)
    } else {
        Ok(value.to_string())
    }
}

fn parse_date(value: &str) -> Result<NaiveDate, Rejection> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| Rejection::BadDate)
}

fn advance(session: &mut Session, next: Step) -> Outcome {
    session.step = next;
    Outcome::reply(prompt(next, &session.draft))
}

/// Like `advance`, replacing the message whose button was pressed
fn advance_in_place(session: &mut Session, next: Step) -> Outcome {
    session.step = next;
    Outcome::reply(prompt(next, &session.draft).editing())
}

fn finish_platforms(session: &mut Session) -> Outcome {
    if session.draft.wants_other_platforms() {
        advance_in_place(session, Step::AwaitingOtherPlatforms)
    } else {
        session.draft.other_platforms = None;
        advance_in_place(session, Step::AwaitingBrand)
    }
}

fn reprompt(session: &Session, rejection: Rejection) -> Outcome {
    let mut reply = prompt(session.step, &session.draft);
    reply.text = format!("{}\n\n{}", rejection.message(), reply.text);
    Outcome::reply(reply)
}

fn prompt(step: Step, draft: &Draft) -> Reply {
    match step {
        Step::Idle => Reply::text(IDLE_HINT),
        Step::AwaitingMode => Reply::with_keyboard(
            "Platform to be used:",
            Keyboard::column([
                Button::new("Single Platform", "mode:single"),
                Button::new("Multistreaming", "mode:multi"),
            ]),
        ),
        Step::AwaitingPlatforms => platforms_prompt(draft),
        Step::AwaitingOtherPlatforms => Reply::text("Please specify other platforms:"),
        Step::AwaitingBrand => Reply::text("Brand Name:"),
        Step::AwaitingDetails(field) => Reply::text(field.prompt()),
        Step::Confirming => Reply::with_keyboard(
            format!(
                "Please confirm your submission:\n\n{}",
                draft.preview().summary()
            ),
            Keyboard::column([
                Button::new("Confirm", "confirm:yes"),
                Button::new("Start over", "confirm:restart"),
                Button::new("Cancel", "confirm:no"),
            ]),
        ),
        Step::AwaitingRecallChoice => Reply::with_keyboard(
            "How would you like to recall submissions?",
            Keyboard::column([
                Button::new("Last 10 submissions", "recall:history"),
                Button::new("Search by Brand Name", "recall:search"),
            ]),
        ),
        Step::AwaitingSearchQuery => Reply::text("Enter the Brand Name to search:"),
        Step::AwaitingExportChoice => Reply::with_keyboard(
            "Choose an export option:",
            Keyboard::column([
                Button::new("All submissions", "export:all"),
                Button::new("Date range", "export:date"),
                Button::new("By requester", "export:requester"),
            ]),
        ),
        Step::AwaitingExportStart => Reply::text("Enter start date (YYYY-MM-DD):"),
        Step::AwaitingExportEnd { .. } => Reply::text("Enter end date (YYYY-MM-DD):"),
        Step::AwaitingExportRequester => Reply::text("Enter requester username (without @):"),
    }
}

fn platforms_prompt(draft: &Draft) -> Reply {
    let multi = draft.platform_mode == Some(PlatformMode::Multi);
    let mut buttons: Vec<Button> = Platform::ALL
        .into_iter()
        .map(|p| {
            let label = if !multi {
                p.label().to_string()
            } else if draft.platforms.contains(&p) {
                format!("[x] {}", p.label())
            } else {
                format!("[ ] {}", p.label())
            };
            Button::new(label, format!("platform:{}", p.label()))
        })
        .collect();

    if multi {
        buttons.push(Button::new("Done", "platform:done"));
        Reply::with_keyboard("Select platform(s), then press Done:", Keyboard::column(buttons))
    } else {
        Reply::with_keyboard("Select a platform:", Keyboard::column(buttons))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAT: ChatRef = ChatRef(100);

    fn controller() -> ConversationController {
        ConversationController::new(
            Duration::from_secs(60),
            Zone::Fixed(chrono::FixedOffset::east_opt(8 * 3600).unwrap()),
        )
    }

    async fn step_of(ctl: &ConversationController, who: &str) -> Step {
        ctl.snapshot(who).await.map(|(step, _)| step).unwrap()
    }

    const DETAILS: [&str; 6] = ["Jo", "Room B", "2026-02-15", "2 cams", "minimal", "none"];

    /// Runs a full multi-platform form up to Confirming.
    async fn fill_form(ctl: &ConversationController, who: &str, brand: &str) {
        ctl.start(who, CHAT).await;
        ctl.handle_choice(who, CHAT, "mode:multi").await;
        ctl.handle_choice(who, CHAT, "platform:TikTok").await;
        ctl.handle_choice(who, CHAT, "platform:Facebook").await;
        ctl.handle_choice(who, CHAT, "platform:done").await;
        ctl.handle_text(who, CHAT, brand).await;
        for detail in DETAILS {
            ctl.handle_text(who, CHAT, detail).await;
        }
    }

    #[tokio::test]
    async fn test_valid_sequence_reaches_confirming() {
        let ctl = controller();
        fill_form(&ctl, "alice", "  ACME Corp ").await;

        let (step, draft) = ctl.snapshot("alice").await.unwrap();
        assert_eq!(step, Step::Confirming);
        assert_eq!(draft.platform_mode, Some(PlatformMode::Multi));
        assert_eq!(draft.platforms, vec![Platform::Facebook, Platform::TikTok]);
        assert_eq!(draft.other_platforms, None);
        assert_eq!(draft.brand_name.as_deref(), Some("ACME Corp"));
        assert_eq!(draft.creator_name.as_deref(), Some("Jo"));
        assert_eq!(draft.room.as_deref(), Some("Room B"));
        assert_eq!(draft.air_date.as_deref(), Some("2026-02-15"));
        assert_eq!(draft.camera_requirements.as_deref(), Some("2 cams"));
        assert_eq!(draft.stage_design.as_deref(), Some("minimal"));
        assert_eq!(draft.other_technical.as_deref(), Some("none"));
    }

    #[tokio::test]
    async fn test_confirm_emits_submission_and_goes_idle() {
        let ctl = controller();
        fill_form(&ctl, "alice", "ACME Corp").await;

        let outcome = ctl.handle_choice("alice", CHAT, "confirm:yes").await;
        let Some(Action::Submit(submission)) = outcome.action else {
            panic!("expected a submission, got {:?}", outcome.action);
        };
        assert_eq!(submission.requester, "alice");
        assert_eq!(submission.brand_name, "ACME Corp");
        assert_eq!(submission.platforms, vec![Platform::Facebook, Platform::TikTok]);
        assert_eq!(submission.other_platforms, "");
        assert_eq!(submission.submitted_at.offset().local_minus_utc(), 8 * 3600);

        let (step, draft) = ctl.snapshot("alice").await.unwrap();
        assert_eq!(step, Step::Idle);
        assert_eq!(draft, Draft::default());
    }

    #[tokio::test]
    async fn test_single_mode_advances_on_first_pick() {
        let ctl = controller();
        ctl.start("bob", CHAT).await;
        ctl.handle_choice("bob", CHAT, "mode:single").await;
        ctl.handle_choice("bob", CHAT, "platform:Shopee").await;

        let (step, draft) = ctl.snapshot("bob").await.unwrap();
        assert_eq!(step, Step::AwaitingBrand);
        assert_eq!(draft.platforms, vec![Platform::Shopee]);
    }

    #[tokio::test]
    async fn test_others_asks_for_other_platforms() {
        let ctl = controller();
        ctl.start("bob", CHAT).await;
        ctl.handle_choice("bob", CHAT, "mode:single").await;
        ctl.handle_choice("bob", CHAT, "platform:Others").await;
        assert_eq!(step_of(&ctl, "bob").await, Step::AwaitingOtherPlatforms);

        ctl.handle_text("bob", CHAT, "   ").await;
        assert_eq!(step_of(&ctl, "bob").await, Step::AwaitingOtherPlatforms);

        ctl.handle_text("bob", CHAT, "Kumu").await;
        let (step, draft) = ctl.snapshot("bob").await.unwrap();
        assert_eq!(step, Step::AwaitingBrand);
        assert_eq!(draft.other_platforms.as_deref(), Some("Kumu"));
    }

    #[tokio::test]
    async fn test_multi_toggle_removes_platform() {
        let ctl = controller();
        ctl.start("bob", CHAT).await;
        ctl.handle_choice("bob", CHAT, "mode:multi").await;
        ctl.handle_choice("bob", CHAT, "platform:Lazada").await;
        let outcome = ctl.handle_choice("bob", CHAT, "platform:Lazada").await;

        let (step, draft) = ctl.snapshot("bob").await.unwrap();
        assert_eq!(step, Step::AwaitingPlatforms);
        assert!(draft.platforms.is_empty());
        assert!(outcome.replies[0].edit_origin);
    }

    #[tokio::test]
    async fn test_done_without_platforms_is_rejected() {
        let ctl = controller();
        ctl.start("bob", CHAT).await;
        ctl.handle_choice("bob", CHAT, "mode:multi").await;
        let outcome = ctl.handle_choice("bob", CHAT, "platform:done").await;

        assert_eq!(step_of(&ctl, "bob").await, Step::AwaitingPlatforms);
        assert!(outcome.replies[0].text.starts_with("Select at least one platform"));
        assert!(outcome.replies[0].keyboard.is_some());
    }

    #[tokio::test]
    async fn test_invalid_input_changes_nothing() {
        let ctl = controller();
        ctl.start("carol", CHAT).await;
        ctl.handle_choice("carol", CHAT, "mode:single").await;
        ctl.handle_choice("carol", CHAT, "platform:YouTube").await;
        ctl.handle_text("carol", CHAT, "Beta").await;
        let before = ctl.snapshot("carol").await.unwrap();
        assert_eq!(before.0, Step::AwaitingDetails(DetailField::CreatorName));

        for outcome in [
            ctl.handle_text("carol", CHAT, " \t ").await,
            ctl.handle_choice("carol", CHAT, "mode:multi").await,
            ctl.handle_choice("carol", CHAT, "platform:Myspace").await,
            ctl.handle_choice("carol", CHAT, "garbage").await,
        ] {
            assert!(outcome.action.is_none());
            assert_eq!(outcome.replies.len(), 1);
        }

        assert_eq!(ctl.snapshot("carol").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_text_on_button_step_reprompts_with_keyboard() {
        let ctl = controller();
        ctl.start("dan", CHAT).await;
        let outcome = ctl.handle_text("dan", CHAT, "multi please").await;

        assert_eq!(step_of(&ctl, "dan").await, Step::AwaitingMode);
        assert!(outcome.replies[0].text.starts_with("Please choose one of the buttons"));
        assert!(outcome.replies[0].keyboard.is_some());
    }

    #[tokio::test]
    async fn test_cancel_then_start_is_fresh() {
        let ctl = controller();
        fill_form(&ctl, "erin", "ACME").await;
        ctl.cancel("erin", CHAT).await;

        let (step, draft) = ctl.snapshot("erin").await.unwrap();
        assert_eq!(step, Step::Idle);
        assert_eq!(draft, Draft::default());

        ctl.start("erin", CHAT).await;
        let (step, draft) = ctl.snapshot("erin").await.unwrap();
        assert_eq!(step, Step::AwaitingMode);
        assert_eq!(draft, Draft::default());
    }

    #[tokio::test]
    async fn test_restart_from_confirming_clears_draft() {
        let ctl = controller();
        fill_form(&ctl, "erin", "ACME").await;
        ctl.handle_choice("erin", CHAT, "confirm:restart").await;

        let (step, draft) = ctl.snapshot("erin").await.unwrap();
        assert_eq!(step, Step::AwaitingMode);
        assert_eq!(draft, Draft::default());
    }

    #[tokio::test]
    async fn test_discard_from_confirming_goes_idle() {
        let ctl = controller();
        fill_form(&ctl, "erin", "ACME").await;
        let outcome = ctl.handle_choice("erin", CHAT, "confirm:no").await;

        assert!(outcome.action.is_none());
        assert_eq!(step_of(&ctl, "erin").await, Step::Idle);
    }

    #[tokio::test]
    async fn test_start_resets_in_progress_form() {
        let ctl = controller();
        ctl.start("fay", CHAT).await;
        ctl.handle_choice("fay", CHAT, "mode:single").await;
        ctl.start("fay", CHAT).await;

        let (step, draft) = ctl.snapshot("fay").await.unwrap();
        assert_eq!(step, Step::AwaitingMode);
        assert_eq!(draft.platform_mode, None);
    }

    #[tokio::test]
    async fn test_stale_button_when_idle() {
        let ctl = controller();
        let outcome = ctl.handle_choice("gus", CHAT, "confirm:yes").await;
        assert!(outcome.action.is_none());
        assert!(outcome.replies[0].text.contains("no longer active"));
    }

    #[tokio::test]
    async fn test_search_flow_emits_query() {
        let ctl = controller();
        ctl.begin_recall("hal", CHAT).await;
        ctl.handle_choice("hal", CHAT, "recall:search").await;
        assert_eq!(step_of(&ctl, "hal").await, Step::AwaitingSearchQuery);

        let outcome = ctl.handle_text("hal", CHAT, " acme ").await;
        assert_eq!(outcome.action, Some(Action::SearchBrand("acme".to_string())));
        assert_eq!(step_of(&ctl, "hal").await, Step::Idle);
    }

    #[tokio::test]
    async fn test_recall_history_choice() {
        let ctl = controller();
        ctl.begin_recall("hal", CHAT).await;
        let outcome = ctl.handle_choice("hal", CHAT, "recall:history").await;
        assert_eq!(outcome.action, Some(Action::RecallLast));
    }

    #[tokio::test]
    async fn test_export_date_range_validates_order() {
        let ctl = controller();
        ctl.begin_export("ivy", CHAT).await;
        ctl.handle_choice("ivy", CHAT, "export:date").await;

        ctl.handle_text("ivy", CHAT, "15/02/2026").await;
        assert_eq!(step_of(&ctl, "ivy").await, Step::AwaitingExportStart);

        ctl.handle_text("ivy", CHAT, "2026-02-10").await;
        let start = NaiveDate::from_ymd_opt(2026, 2, 10).unwrap();
        assert_eq!(step_of(&ctl, "ivy").await, Step::AwaitingExportEnd { start });

        let outcome = ctl.handle_text("ivy", CHAT, "2026-02-01").await;
        assert!(outcome.action.is_none());
        assert_eq!(step_of(&ctl, "ivy").await, Step::AwaitingExportEnd { start });

        let outcome = ctl.handle_text("ivy", CHAT, "2026-02-20").await;
        assert_eq!(
            outcome.action,
            Some(Action::Export(ExportFilter::DateRange {
                start,
                end: NaiveDate::from_ymd_opt(2026, 2, 20).unwrap(),
            }))
        );
    }

    #[tokio::test]
    async fn test_export_by_requester_strips_at() {
        let ctl = controller();
        ctl.begin_export("ivy", CHAT).await;
        ctl.handle_choice("ivy", CHAT, "export:requester").await;
        let outcome = ctl.handle_text("ivy", CHAT, "@alice").await;
        assert_eq!(
            outcome.action,
            Some(Action::Export(ExportFilter::Requester("alice".to_string())))
        );
    }

    #[tokio::test]
    async fn test_sweep_resets_expired_and_drops_idle() {
        let ctl = controller();
        ctl.start("jan", ChatRef(7)).await;
        ctl.handle_choice("jan", ChatRef(7), "mode:single").await;
        ctl.cancel("kim", ChatRef(8)).await;

        let later = Instant::now() + Duration::from_secs(120);
        let expired = ctl.sweep_expired_at(later).await;
        assert_eq!(expired, vec![ChatRef(7)]);
        assert!(ctl.snapshot("jan").await.is_none());
        assert!(ctl.snapshot("kim").await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_keeps_active_sessions() {
        let ctl = controller();
        ctl.start("jan", CHAT).await;
        let expired = ctl.sweep_expired_at(Instant::now()).await;
        assert!(expired.is_empty());
        assert_eq!(step_of(&ctl, "jan").await, Step::AwaitingMode);
    }

    #[tokio::test]
    async fn test_late_step_input_only_gets_timeout_notice() {
        let ctl = controller();
        ctl.start("max", CHAT).await;
        ctl.handle_choice("max", CHAT, "mode:single").await;
        let later = Instant::now() + Duration::from_secs(120);

        let outcome = ctl
            .apply_at("max", CHAT, Input::Choice("platform:TikTok"), later)
            .await;
        assert_eq!(outcome.replies.len(), 1);
        assert_eq!(outcome.replies[0].text, TIMEOUT_NOTICE);
        assert!(outcome.action.is_none());
        let (step, draft) = ctl.snapshot("max").await.unwrap();
        assert_eq!(step, Step::Idle);
        assert!(draft.platform_mode.is_none());
        assert!(draft.platforms.is_empty());

        ctl.start("ned", CHAT).await;
        let outcome = ctl.apply_at("ned", CHAT, Input::Text("ACME"), later).await;
        assert_eq!(outcome.replies[0].text, TIMEOUT_NOTICE);
        assert_eq!(step_of(&ctl, "ned").await, Step::Idle);
    }

    #[tokio::test]
    async fn test_late_start_is_still_applied() {
        let ctl = controller();
        ctl.start("max", CHAT).await;
        ctl.handle_choice("max", CHAT, "mode:multi").await;
        let later = Instant::now() + Duration::from_secs(120);

        let outcome = ctl.apply_at("max", CHAT, Input::Start, later).await;
        assert!(outcome
            .replies
            .iter()
            .all(|reply| reply.text != TIMEOUT_NOTICE));
        let (step, draft) = ctl.snapshot("max").await.unwrap();
        assert_eq!(step, Step::AwaitingMode);
        assert!(draft.platform_mode.is_none());
    }

    #[tokio::test]
    async fn test_active_count_ignores_idle_sessions() {
        let ctl = controller();
        ctl.start("jan", CHAT).await;
        ctl.start("kim", CHAT).await;
        ctl.cancel("kim", CHAT).await;
        ctl.handle_text("lou", CHAT, "hello").await;
        assert_eq!(ctl.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_interleaved_requesters_stay_independent() {
        let ctl = Arc::new(controller());

        let run = |who: &'static str, brand: &'static str, platform: &'static str| {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move {
                ctl.start(who, CHAT).await;
                tokio::task::yield_now().await;
                ctl.handle_choice(who, CHAT, "mode:single").await;
                tokio::task::yield_now().await;
                ctl.handle_choice(who, CHAT, &format!("platform:{}", platform))
                    .await;
                ctl.handle_text(who, CHAT, brand).await;
                for detail in DETAILS {
                    tokio::task::yield_now().await;
                    ctl.handle_text(who, CHAT, &format!("{}-{}", who, detail))
                        .await;
                }
                ctl.handle_choice(who, CHAT, "confirm:yes").await.action
            })
        };

        let a = run("anna", "Alpha", "Shopee");
        let b = run("ben", "Beta", "TikTok");
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let (Some(Action::Submit(a)), Some(Action::Submit(b))) = (a, b) else {
            panic!("both flows should submit");
        };
        assert_eq!(a.requester, "anna");
        assert_eq!(a.brand_name, "Alpha");
        assert_eq!(a.platforms, vec![Platform::Shopee]);
        assert_eq!(a.creator_name, "anna-Jo");
        assert_eq!(b.requester, "ben");
        assert_eq!(b.brand_name, "Beta");
        assert_eq!(b.platforms, vec![Platform::TikTok]);
        assert_eq!(b.other_technical, "ben-none");
    }
}
