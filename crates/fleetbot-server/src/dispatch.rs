//! Command routing: parse, resolve, authorize, execute, respond.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use fleetbot_contracts::Permission;
use fleetbot_kernel::{bullet_list, parse_command, LINE_SEPARATOR};
use thiserror::Error;

use crate::authz::Authorizer;
use crate::instances::MessageSink;
use crate::messages::Translator;
use crate::messenger::Messenger;
use crate::store::StoreError;

/// Per-invocation identity of the inbound event and its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub event_id: String,
    pub chat_id: i64,
    pub username: String,
    pub language_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    /// The handler already pushed everything it had to say.
    Silent,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),
    #[error("{0}")]
    ExecutionFailed(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        CommandError::Internal(err.to_string())
    }
}

#[async_trait]
pub trait Command: Send + Sync {
    /// Translation key of the one-line description shown by `/help`.
    fn description(&self) -> &'static str;
    fn required_permissions(&self) -> &'static [Permission];
    async fn run(&self, call: &CommandCall<'_>) -> Result<Reply, CommandError>;
}

pub struct CommandCall<'a> {
    pub ctx: &'a RequestContext,
    pub name: &'a str,
    pub args: &'a [String],
    pub dispatcher: &'a Dispatcher,
}

impl CommandCall<'_> {
    pub fn tr(&self, template: &str, params: &[String]) -> String {
        self.dispatcher.tr(self.ctx, template, params)
    }

    pub async fn send(&self, text: &str) {
        self.dispatcher.send(self.ctx, text).await;
    }
}

#[async_trait]
impl MessageSink for CommandCall<'_> {
    async fn notify(&self, template: &str, params: &[String]) {
        self.send(&self.tr(template, params)).await;
    }
}

#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Arc<dyn Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `name` includes the leading slash.
    pub fn register(&mut self, name: &str, command: Arc<dyn Command>) {
        self.commands.insert(name.to_ascii_lowercase(), command);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Command>> {
        self.commands.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Command>)> {
        self.commands.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Executed { command: String },
    NotACommand,
    UnknownCommand { command: String },
    Unauthorized { command: String },
    InvalidSyntax { command: String },
    ExecutionFailed { command: String },
    Internal { command: String },
}

impl DispatchOutcome {
    pub fn command(&self) -> &str {
        match self {
            DispatchOutcome::NotACommand => "",
            DispatchOutcome::Executed { command }
            | DispatchOutcome::UnknownCommand { command }
            | DispatchOutcome::Unauthorized { command }
            | DispatchOutcome::InvalidSyntax { command }
            | DispatchOutcome::ExecutionFailed { command }
            | DispatchOutcome::Internal { command } => command,
        }
    }

    pub fn result(&self) -> &'static str {
        match self {
            DispatchOutcome::Executed { .. } => "executed",
            DispatchOutcome::NotACommand
            | DispatchOutcome::UnknownCommand { .. }
            | DispatchOutcome::Unauthorized { .. } => "rejected",
            DispatchOutcome::InvalidSyntax { .. }
            | DispatchOutcome::ExecutionFailed { .. }
            | DispatchOutcome::Internal { .. } => "failed",
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            DispatchOutcome::Executed { .. } => "ok",
            DispatchOutcome::NotACommand => "not_a_command",
            DispatchOutcome::UnknownCommand { .. } => "unknown_command",
            DispatchOutcome::Unauthorized { .. } => "unauthorized",
            DispatchOutcome::InvalidSyntax { .. } => "invalid_syntax",
            DispatchOutcome::ExecutionFailed { .. } => "execution_error",
            DispatchOutcome::Internal { .. } => "internal",
        }
    }
}

pub struct Dispatcher {
    registry: CommandRegistry,
    authz: Arc<dyn Authorizer>,
    messenger: Arc<dyn Messenger>,
    translator: Arc<dyn Translator>,
}

impl Dispatcher {
    pub fn new(
        registry: CommandRegistry,
        authz: Arc<dyn Authorizer>,
        messenger: Arc<dyn Messenger>,
        translator: Arc<dyn Translator>,
    ) -> Self {
        Self {
            registry,
            authz,
            messenger,
            translator,
        }
    }

    pub fn authz(&self) -> &dyn Authorizer {
        self.authz.as_ref()
    }

    pub fn tr(&self, ctx: &RequestContext, template: &str, params: &[String]) -> String {
        self.translator
            .translate(&ctx.language_code, template, params)
    }

    /// Delivery failures are logged; the invocation carries on.
    pub async fn send(&self, ctx: &RequestContext, text: &str) {
        if let Err(err) = self.messenger.send_message(ctx.chat_id, text).await {
            tracing::error!(error = %err, chat_id = ctx.chat_id, event_id = %ctx.event_id, "reply delivery failed");
        }
    }

    async fn passes_gate(&self, ctx: &RequestContext, command: &dyn Command) -> Result<(), Permission> {
        for permission in command.required_permissions() {
            if !self.authz.has_permission(&ctx.username, *permission).await {
                return Err(*permission);
            }
        }
        Ok(())
    }

    /// `(name, translated description)` for every command the caller may run.
    pub async fn allowed_commands(&self, ctx: &RequestContext) -> Vec<(String, String)> {
        let mut allowed = Vec::new();
        for (name, command) in self.registry.iter() {
            if self.passes_gate(ctx, command.as_ref()).await.is_ok() {
                allowed.push((name.clone(), self.tr(ctx, command.description(), &[])));
            }
        }
        allowed
    }

    pub async fn render_command_list(&self, ctx: &RequestContext) -> Option<String> {
        let allowed = self.allowed_commands(ctx).await;
        if allowed.is_empty() {
            return None;
        }
        Some(bullet_list(
            allowed
                .into_iter()
                .map(|(name, description)| self.tr(ctx, "help.item", &[name, description])),
        ))
    }

    pub async fn dispatch(&self, ctx: &RequestContext, text: &str) -> DispatchOutcome {
        let Ok(parsed) = parse_command(text) else {
            self.send(ctx, &self.tr(ctx, "error.not_a_command", &[])).await;
            return DispatchOutcome::NotACommand;
        };
        let command_name = parsed.name.clone();

        let Some(command) = self.registry.get(&parsed.name).cloned() else {
            let mut reply = self.tr(ctx, "error.unknown_command", &[parsed.name.clone()]);
            if let Some(list) = self.render_command_list(ctx).await {
                reply.push_str(LINE_SEPARATOR);
                reply.push_str(&list);
            }
            self.send(ctx, &reply).await;
            return DispatchOutcome::UnknownCommand {
                command: command_name,
            };
        };

        if let Err(missing) = self.passes_gate(ctx, command.as_ref()).await {
            tracing::warn!(
                username = %ctx.username,
                command = %command_name,
                missing = %missing,
                "permission check failed"
            );
            self.send(ctx, &self.tr(ctx, "error.unauthorized", &[])).await;
            return DispatchOutcome::Unauthorized {
                command: command_name,
            };
        }

        let call = CommandCall {
            ctx,
            name: &parsed.name,
            args: &parsed.args,
            dispatcher: self,
        };
        match command.run(&call).await {
            Ok(Reply::Text(text)) => {
                self.send(ctx, &text).await;
                DispatchOutcome::Executed {
                    command: command_name,
                }
            }
            Ok(Reply::Silent) => DispatchOutcome::Executed {
                command: command_name,
            },
            Err(CommandError::InvalidSyntax(detail)) => {
                self.send(ctx, &self.tr(ctx, "error.invalid_syntax", &[detail]))
                    .await;
                DispatchOutcome::InvalidSyntax {
                    command: command_name,
                }
            }
            Err(CommandError::ExecutionFailed(message)) => {
                tracing::info!(command = %command_name, message = %message, "command execution failed");
                self.send(ctx, &message).await;
                DispatchOutcome::ExecutionFailed {
                    command: command_name,
                }
            }
            Err(CommandError::Unauthorized(detail)) => {
                tracing::warn!(username = %ctx.username, command = %command_name, detail = %detail, "handler rejected caller");
                self.send(ctx, &self.tr(ctx, "error.unauthorized", &[])).await;
                DispatchOutcome::Unauthorized {
                    command: command_name,
                }
            }
            Err(CommandError::Internal(detail)) => {
                tracing::error!(command = %command_name, event_id = %ctx.event_id, detail = %detail, "command failed internally");
                self.send(ctx, &self.tr(ctx, "error.internal", &[])).await;
                DispatchOutcome::Internal {
                    command: command_name,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::AuthorizationEngine;
    use crate::fakes::RecordingMessenger;
    use crate::messages::MessageCatalog;
    use crate::store::{put_json, BlobStore, MemoryBlobStore};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestCommand {
        seen: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl Command for TestCommand {
        fn description(&self) -> &'static str {
            "test command"
        }

        fn required_permissions(&self) -> &'static [Permission] {
            &[Permission::RunNodes]
        }

        async fn run(&self, call: &CommandCall<'_>) -> Result<Reply, CommandError> {
            self.seen.lock().unwrap().push(call.args.to_vec());
            match call.args.first().map(String::as_str) {
                Some("syntax") => Err(CommandError::InvalidSyntax("need more".to_string())),
                Some("fail") => Err(CommandError::ExecutionFailed("Server x not found".to_string())),
                Some("boom") => Err(CommandError::Internal("store offline".to_string())),
                Some("quiet") => Ok(Reply::Silent),
                _ => Ok(Reply::Text(format!("ran with {}", call.args.join(",")))),
            }
        }
    }

    struct OpenCommand;

    #[async_trait]
    impl Command for OpenCommand {
        fn description(&self) -> &'static str {
            "open command"
        }

        fn required_permissions(&self) -> &'static [Permission] {
            &[]
        }

        async fn run(&self, _call: &CommandCall<'_>) -> Result<Reply, CommandError> {
            Ok(Reply::Text("open".to_string()))
        }
    }

    struct GatedCommand {
        needs: &'static [Permission],
        seen: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl Command for GatedCommand {
        fn description(&self) -> &'static str {
            "gated command"
        }

        fn required_permissions(&self) -> &'static [Permission] {
            self.needs
        }

        async fn run(&self, call: &CommandCall<'_>) -> Result<Reply, CommandError> {
            self.seen.lock().unwrap().push(call.args.to_vec());
            Ok(Reply::Silent)
        }
    }

    /// A dispatcher whose only command is `/test`, over an empty permission table.
    fn only_test_command(
        needs: &'static [Permission],
    ) -> (Dispatcher, Arc<RecordingMessenger>, Arc<GatedCommand>) {
        let command = Arc::new(GatedCommand {
            needs,
            seen: Mutex::new(Vec::new()),
        });
        let mut registry = CommandRegistry::new();
        registry.register("/test", command.clone());
        let messenger = Arc::new(RecordingMessenger::default());
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::default());
        let dispatcher = Dispatcher::new(
            registry,
            Arc::new(AuthorizationEngine::new(true, store, "permissions.json")),
            messenger.clone(),
            Arc::new(MessageCatalog::builtin("en")),
        );
        (dispatcher, messenger, command)
    }

    struct Fixture {
        dispatcher: Dispatcher,
        messenger: Arc<RecordingMessenger>,
        test: Arc<TestCommand>,
    }

    async fn fixture() -> Fixture {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::default());
        put_json(
            store.as_ref(),
            "permissions.json",
            &json!({"runner": [{"service": null, "permission": "RUN_NODES"}]}),
        )
        .await
        .unwrap();
        let test = Arc::new(TestCommand::default());
        let mut registry = CommandRegistry::new();
        registry.register("/test", test.clone());
        registry.register("/open", Arc::new(OpenCommand));
        let messenger = Arc::new(RecordingMessenger::default());
        Fixture {
            dispatcher: Dispatcher::new(
                registry,
                Arc::new(AuthorizationEngine::new(true, store, "permissions.json")),
                messenger.clone(),
                Arc::new(MessageCatalog::builtin("en")),
            ),
            messenger,
            test,
        }
    }

    fn ctx(username: &str) -> RequestContext {
        RequestContext {
            event_id: "1".to_string(),
            chat_id: 99,
            username: username.to_string(),
            language_code: "en".to_string(),
        }
    }

    #[tokio::test]
    async fn passes_positional_arguments() {
        let f = fixture().await;
        let outcome = f.dispatcher.dispatch(&ctx("runner"), "/test command arg").await;
        assert_eq!(
            outcome,
            DispatchOutcome::Executed {
                command: "/test".to_string()
            }
        );
        assert_eq!(*f.test.seen.lock().unwrap(), vec![vec!["command", "arg"]]);
        assert_eq!(f.messenger.texts(), vec!["ran with command,arg"]);
        assert_eq!(f.messenger.sent.lock().unwrap()[0].0, 99);
    }

    #[tokio::test]
    async fn unauthorized_caller_never_reaches_handler() {
        let f = fixture().await;
        let outcome = f.dispatcher.dispatch(&ctx("stranger"), "/test command arg").await;
        assert_eq!(outcome.reason_code(), "unauthorized");
        assert!(f.test.seen.lock().unwrap().is_empty());
        assert_eq!(
            f.messenger.texts(),
            vec!["You are not authorized to perform this action."]
        );
    }

    #[tokio::test]
    async fn open_command_receives_its_arguments() {
        let (dispatcher, messenger, command) = only_test_command(&[]);
        let outcome = dispatcher.dispatch(&ctx("anyone"), "/test command arg").await;
        assert_eq!(outcome.reason_code(), "ok");
        assert_eq!(*command.seen.lock().unwrap(), vec![vec!["command", "arg"]]);
        assert!(messenger.texts().is_empty());
    }

    #[tokio::test]
    async fn root_only_command_denies_with_the_generic_reply() {
        let (dispatcher, messenger, command) = only_test_command(&[Permission::RootAccess]);
        let outcome = dispatcher.dispatch(&ctx("anyone"), "/test command arg").await;
        assert!(matches!(outcome, DispatchOutcome::Unauthorized { .. }));
        assert!(command.seen.lock().unwrap().is_empty());
        assert_eq!(
            messenger.texts(),
            vec!["You are not authorized to perform this action."]
        );
    }

    #[tokio::test]
    async fn plain_text_is_not_a_command() {
        let f = fixture().await;
        let outcome = f.dispatcher.dispatch(&ctx("runner"), "hello there").await;
        assert_eq!(outcome, DispatchOutcome::NotACommand);
        assert!(f.messenger.texts()[0].starts_with("Messages must be commands"));
    }

    #[tokio::test]
    async fn unknown_command_lists_what_the_caller_may_use() {
        let f = fixture().await;
        f.dispatcher.dispatch(&ctx("stranger"), "/nope").await;
        assert_eq!(
            f.messenger.texts(),
            vec!["Unknown command /nope. Commands available to you:\n• /open open command"]
        );

        f.dispatcher.dispatch(&ctx("runner"), "/nope").await;
        let reply = &f.messenger.texts()[1];
        assert!(reply.contains("• /open open command"));
        assert!(reply.contains("• /test test command"));
    }

    #[tokio::test]
    async fn handler_errors_map_to_replies() {
        let f = fixture().await;
        let runner = ctx("runner");

        let outcome = f.dispatcher.dispatch(&runner, "/test syntax").await;
        assert_eq!(outcome.reason_code(), "invalid_syntax");
        let outcome = f.dispatcher.dispatch(&runner, "/test fail").await;
        assert_eq!(outcome.reason_code(), "execution_error");
        let outcome = f.dispatcher.dispatch(&runner, "/test boom").await;
        assert_eq!(outcome.result(), "failed");
        let outcome = f.dispatcher.dispatch(&runner, "/test quiet").await;
        assert_eq!(outcome.result(), "executed");

        assert_eq!(
            f.messenger.texts(),
            vec![
                "Invalid syntax: need more",
                "Server x not found",
                "Something went wrong while handling your request. Please try again later."
            ]
        );
    }

    #[tokio::test]
    async fn bot_mention_and_case_resolve_to_the_same_command() {
        let f = fixture().await;
        let outcome = f.dispatcher.dispatch(&ctx("runner"), "/TEST@fleet_bot x").await;
        assert_eq!(outcome.command(), "/test");
        assert_eq!(f.messenger.texts(), vec!["ran with x"]);
    }
}
