//! Admin commands
//!
//! Multi-page command sessions run against one node. A request is offered
//! to an ordered list of handlers; the first that accepts it moves the
//! session along (start, next, prev or cancel) and the command renders the
//! resulting page. Once the last page has been shown the collected form
//! values are committed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use collab_core::{CollabError, CollabResult};

use crate::{LoadCheckSettings, NodeContext};

pub const VIEW_CHANNELS: &str = "view_channels";
pub const CONFIGURE_LOAD_BALANCER: &str = "configure_load_balancer";

/// Submitted form values, field name to value
pub type FormState = BTreeMap<String, String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminAction {
    Execute,
    Next,
    Prev,
    Cancel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Executing,
    Completed,
    Canceled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteKind {
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub kind: NoteKind,
    pub text: String,
}

impl Note {
    pub fn error(text: impl Into<String>) -> Self {
        Note {
            kind: NoteKind::Error,
            text: text.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub var: String,
    pub label: String,
    pub values: Vec<String>,
    pub required: bool,
}

impl Field {
    pub fn input(var: &str, label: &str, value: Option<&String>) -> Self {
        Field {
            var: var.to_string(),
            label: label.to_string(),
            values: value.cloned().into_iter().collect(),
            required: true,
        }
    }

    pub fn fixed(var: &str, label: &str, values: impl IntoIterator<Item = String>) -> Self {
        Field {
            var: var.to_string(),
            label: label.to_string(),
            values: values.into_iter().collect(),
            required: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub title: String,
    pub instructions: String,
    pub fields: Vec<Field>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminRequest {
    /// Command name
    pub node: String,
    #[serde(default)]
    pub action: Option<AdminAction>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub form: FormState,
}

impl AdminRequest {
    /// First request of a session
    pub fn start(node: &str) -> Self {
        AdminRequest {
            node: node.to_string(),
            action: None,
            session_id: None,
            form: FormState::new(),
        }
    }

    /// Follow-up request within `response`'s session
    pub fn follow(response: &AdminResponse, action: AdminAction, form: FormState) -> Self {
        AdminRequest {
            node: response.node.clone(),
            action: Some(action),
            session_id: response.session_id.clone(),
            form,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminResponse {
    pub node: String,
    pub session_id: Option<String>,
    pub status: CommandStatus,
    pub page: Option<Page>,
    pub notes: Vec<Note>,
}

/// A page of a command, rendered from the state collected so far
#[async_trait]
pub trait AdminPage: Send + Sync {
    async fn render(&self, ctx: &Arc<NodeContext>, state: &FormState) -> CollabResult<Page>;
}

/// Applies a completed command
#[async_trait]
pub trait StateChanger: Send + Sync {
    /// Form fields kept from submissions
    fn required(&self) -> &[&'static str];

    async fn commit(&self, ctx: &Arc<NodeContext>, data: &FormState) -> CollabResult<()>;
}

/// Progress through one command's pages
#[derive(Debug, Default)]
pub struct Session {
    id: Option<String>,
    /// Pages shown so far
    index: usize,
    history: Vec<FormState>,
}

impl Session {
    fn reset(&mut self) {
        *self = Session::default();
    }

    /// Latest submitted state
    fn head(&self) -> FormState {
        self.history.last().cloned().unwrap_or_default()
    }

    /// Everything submitted, later values winning
    fn merged(&self) -> FormState {
        self.history
            .iter()
            .flat_map(|form| form.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Where a handler moved the session
#[derive(Debug)]
pub enum Transition {
    Cancel,
    /// Show the page at this index
    Show(usize),
}

pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, request: &AdminRequest) -> bool;

    /// Update the session for `request`. `pages` is the command's page count.
    fn transition(
        &self,
        session: &mut Session,
        request: &AdminRequest,
        required: &[&'static str],
        pages: usize,
    ) -> CollabResult<Transition>;
}

pub struct CancelHandler;

impl CommandHandler for CancelHandler {
    fn name(&self) -> &'static str {
        "cancel"
    }

    fn can_handle(&self, request: &AdminRequest) -> bool {
        request.action == Some(AdminAction::Cancel)
    }

    fn transition(
        &self,
        session: &mut Session,
        _: &AdminRequest,
        _: &[&'static str],
        _: usize,
    ) -> CollabResult<Transition> {
        session.reset();
        Ok(Transition::Cancel)
    }
}

pub struct PrevHandler;

impl CommandHandler for PrevHandler {
    fn name(&self) -> &'static str {
        "prev"
    }

    fn can_handle(&self, request: &AdminRequest) -> bool {
        request.action == Some(AdminAction::Prev)
    }

    fn transition(
        &self,
        session: &mut Session,
        _: &AdminRequest,
        _: &[&'static str],
        _: usize,
    ) -> CollabResult<Transition> {
        if session.index < 2 {
            return Err(CollabError::CommandError("No more pages in history".into()));
        }
        session.history.pop();
        session.index -= 1;
        Ok(Transition::Show(session.index - 1))
    }
}

pub struct NextHandler;

impl CommandHandler for NextHandler {
    fn name(&self) -> &'static str {
        "next"
    }

    fn can_handle(&self, request: &AdminRequest) -> bool {
        request.session_id.is_some()
            && !matches!(request.action, Some(AdminAction::Prev | AdminAction::Cancel))
    }

    fn transition(
        &self,
        session: &mut Session,
        request: &AdminRequest,
        required: &[&'static str],
        pages: usize,
    ) -> CollabResult<Transition> {
        if session.id.is_none() || session.id != request.session_id {
            return Err(CollabError::CommandError("Unknown session".into()));
        }
        if session.index >= pages {
            return Err(CollabError::CommandError("No more pages loaded".into()));
        }
        let kept = request
            .form
            .iter()
            .filter(|(k, _)| required.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        session.history.push(kept);
        session.index += 1;
        Ok(Transition::Show(session.index - 1))
    }
}

pub struct StartHandler {
    sessions: AtomicU64,
}

impl CommandHandler for StartHandler {
    fn name(&self) -> &'static str {
        "start"
    }

    fn can_handle(&self, request: &AdminRequest) -> bool {
        request.session_id.is_none()
    }

    fn transition(
        &self,
        session: &mut Session,
        request: &AdminRequest,
        _: &[&'static str],
        pages: usize,
    ) -> CollabResult<Transition> {
        if pages == 0 {
            return Err(CollabError::CommandError("No pages loaded".into()));
        }
        session.reset();
        let n = self.sessions.fetch_add(1, Ordering::Relaxed);
        session.id = Some(format!("{}-{}", request.node, n));
        session.index = 1;
        Ok(Transition::Show(0))
    }
}

/// One named admin command
pub struct AdminCommand {
    node: &'static str,
    title: &'static str,
    pages: Vec<Box<dyn AdminPage>>,
    changer: Box<dyn StateChanger>,
    session: Mutex<Session>,
}

impl AdminCommand {
    pub fn new(
        node: &'static str,
        title: &'static str,
        pages: Vec<Box<dyn AdminPage>>,
        changer: Box<dyn StateChanger>,
    ) -> Self {
        AdminCommand {
            node,
            title,
            pages,
            changer,
            session: Mutex::new(Session::default()),
        }
    }

    pub fn node(&self) -> &'static str {
        self.node
    }

    pub fn title(&self) -> &'static str {
        self.title
    }
}

/// Admin commands of one node
pub struct AdminService {
    ctx: Arc<NodeContext>,
    handlers: Vec<Box<dyn CommandHandler>>,
    commands: Vec<AdminCommand>,
}

impl AdminService {
    /// Service with the built-in commands
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        AdminService {
            ctx,
            handlers: vec![
                Box::new(CancelHandler),
                Box::new(PrevHandler),
                Box::new(NextHandler),
                Box::new(StartHandler {
                    sessions: AtomicU64::new(1),
                }),
            ],
            commands: vec![view_channels(), configure_load_balancer()],
        }
    }

    pub fn with_command(mut self, command: AdminCommand) -> Self {
        self.commands.push(command);
        self
    }

    /// (name, title) of every command
    pub fn commands(&self) -> Vec<(&'static str, &'static str)> {
        self.commands.iter().map(|c| (c.node, c.title)).collect()
    }

    pub async fn process(&self, request: AdminRequest) -> CollabResult<AdminResponse> {
        let command = self
            .commands
            .iter()
            .find(|c| c.node == request.node)
            .ok_or_else(|| CollabError::CommandError(format!("Unknown command {}", request.node)))?;
        let handler = self
            .handlers
            .iter()
            .find(|h| h.can_handle(&request))
            .ok_or_else(|| CollabError::CommandError("Request not handled".into()))?;

        tracing::debug!(
            node = %self.ctx.name(),
            command = command.node,
            handler = handler.name(),
            "admin request"
        );

        let mut session = command.session.lock().await;
        let outcome = self.step(command, handler.as_ref(), &mut session, &request).await;
        match outcome {
            Ok(response) => Ok(response),
            Err(e) => {
                tracing::warn!(node = %self.ctx.name(), command = command.node, error = %e, "admin command failed");
                session.reset();
                Ok(AdminResponse {
                    node: request.node,
                    session_id: request.session_id,
                    status: CommandStatus::Completed,
                    page: None,
                    notes: vec![Note::error(e.to_string())],
                })
            }
        }
    }

    async fn step(
        &self,
        command: &AdminCommand,
        handler: &dyn CommandHandler,
        session: &mut Session,
        request: &AdminRequest,
    ) -> CollabResult<AdminResponse> {
        let transition =
            handler.transition(session, request, command.changer.required(), command.pages.len())?;

        let index = match transition {
            Transition::Cancel => {
                return Ok(AdminResponse {
                    node: request.node.clone(),
                    session_id: request.session_id.clone(),
                    status: CommandStatus::Canceled,
                    page: None,
                    notes: Vec::new(),
                })
            }
            Transition::Show(index) => index,
        };

        let page = command
            .pages
            .get(index)
            .ok_or_else(|| CollabError::CommandError("No such page".into()))?
            .render(&self.ctx, &session.head())
            .await?;

        let mut response = AdminResponse {
            node: request.node.clone(),
            session_id: session.id.clone(),
            status: CommandStatus::Executing,
            page: Some(page),
            notes: Vec::new(),
        };

        if session.index == command.pages.len() {
            let data = session.merged();
            session.reset();
            response.status = CommandStatus::Completed;
            if let Err(e) = command.changer.commit(&self.ctx, &data).await {
                response.notes.push(Note::error(e.to_string()));
            }
        }
        Ok(response)
    }
}

// Built-in commands

struct ChannelsPage;

#[async_trait]
impl AdminPage for ChannelsPage {
    async fn render(&self, ctx: &Arc<NodeContext>, _: &FormState) -> CollabResult<Page> {
        Ok(Page {
            title: format!("Channels of {}", ctx.name()),
            instructions: String::new(),
            fields: vec![
                Field::fixed("inputs", "Input channels", ctx.inputs().await?),
                Field::fixed("outputs", "Output channels", ctx.output_channels().await?),
                Field::fixed("errors", "Error channels", ctx.error_channels().await?),
            ],
        })
    }
}

struct NoChange;

#[async_trait]
impl StateChanger for NoChange {
    fn required(&self) -> &[&'static str] {
        &[]
    }

    async fn commit(&self, _: &Arc<NodeContext>, _: &FormState) -> CollabResult<()> {
        Ok(())
    }
}

pub fn view_channels() -> AdminCommand {
    AdminCommand::new(
        VIEW_CHANNELS,
        "View channels",
        vec![Box::new(ChannelsPage)],
        Box::new(NoChange),
    )
}

struct LoadBalancerForm;

#[async_trait]
impl AdminPage for LoadBalancerForm {
    async fn render(&self, ctx: &Arc<NodeContext>, _: &FormState) -> CollabResult<Page> {
        let current = ctx.load_check();
        let frequency = current.interval.as_secs_f64().to_string();
        let enabled = current.enabled.to_string();
        Ok(Page {
            title: "Configure load balancer".to_string(),
            instructions: "Seconds between load checks (at least 1)".to_string(),
            fields: vec![
                Field::input("frequency", "Frequency", Some(&frequency)),
                Field::input("enabled", "Enabled", Some(&enabled)),
            ],
        })
    }
}

struct LoadBalancerSummary;

#[async_trait]
impl AdminPage for LoadBalancerSummary {
    async fn render(&self, _: &Arc<NodeContext>, state: &FormState) -> CollabResult<Page> {
        Ok(Page {
            title: "Load balancer".to_string(),
            instructions: "Settings applied".to_string(),
            fields: state
                .iter()
                .map(|(k, v)| Field::fixed(k, k, [v.clone()]))
                .collect(),
        })
    }
}

struct ConfigureLoadBalancer;

fn parse_flag(raw: &str) -> CollabResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(CollabError::CommandError(format!("Invalid flag {}", other))),
    }
}

#[async_trait]
impl StateChanger for ConfigureLoadBalancer {
    fn required(&self) -> &[&'static str] {
        &["frequency", "enabled"]
    }

    async fn commit(&self, ctx: &Arc<NodeContext>, data: &FormState) -> CollabResult<()> {
        let raw = data
            .get("frequency")
            .ok_or_else(|| CollabError::CommandError("Missing field frequency".into()))?;
        let seconds: f64 = raw
            .trim()
            .parse()
            .map_err(|_| CollabError::CommandError(format!("Invalid frequency {}", raw)))?;
        if !seconds.is_finite() {
            return Err(CollabError::CommandError(format!("Invalid frequency {}", raw)));
        }
        let enabled = match data.get("enabled") {
            Some(flag) => parse_flag(flag)?,
            None => true,
        };

        let settings = LoadCheckSettings {
            enabled,
            interval: Duration::from_secs_f64(seconds.max(1.0)),
        };
        tracing::info!(
            node = %ctx.name(),
            enabled,
            interval = %humantime::format_duration(settings.interval),
            "load balancer configured"
        );
        ctx.set_load_check(settings);
        Ok(())
    }
}

pub fn configure_load_balancer() -> AdminCommand {
    AdminCommand::new(
        CONFIGURE_LOAD_BALANCER,
        "Configure load balancer",
        vec![Box::new(LoadBalancerForm), Box::new(LoadBalancerSummary)],
        Box::new(ConfigureLoadBalancer),
    )
}
