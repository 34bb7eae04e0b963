//! A single command: parameters, progress, results, and the state
//! machine governing its lifecycle.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde_json::{Map, Value};

use crate::command::queue::QueueShared;
use crate::component::DomainError;

pub type JsonObject = Map<String, Value>;

/// Command lifecycle states.
///
/// `Queued` is only reachable at construction; `Done`, `Cancelled`,
/// `Aborted` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Queued,
    InProgress,
    Paused,
    Error,
    Done,
    Cancelled,
    Aborted,
    Expired,
}

impl CommandState {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandState::Queued => "queued",
            CommandState::InProgress => "inProgress",
            CommandState::Paused => "paused",
            CommandState::Error => "error",
            CommandState::Done => "done",
            CommandState::Cancelled => "cancelled",
            CommandState::Aborted => "aborted",
            CommandState::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Done
                | CommandState::Cancelled
                | CommandState::Aborted
                | CommandState::Expired
        )
    }
}

/// Where the command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Cloud,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Cloud => "cloud",
        }
    }
}

/// Error payload attached to failed/aborted commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({ "code": self.code, "message": self.message })
    }
}

impl From<&DomainError> for ErrorInfo {
    fn from(err: &DomainError) -> Self {
        ErrorInfo::new(err.code(), err.to_string())
    }
}

/// Observable mutations on a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEvent {
    StateChanged,
    ProgressChanged,
    ResultsChanged,
    ErrorChanged,
}

type Observer = Rc<dyn Fn(CommandEvent)>;

pub struct CommandInstance {
    id: String,
    name: String,
    component: String,
    origin: Origin,
    state: CommandState,
    parameters: JsonObject,
    progress: JsonObject,
    results: JsonObject,
    error: Option<ErrorInfo>,
    observers: Vec<Observer>,
    pub(crate) queue: Option<Weak<QueueShared>>,
    pub(crate) handler_dispatched: bool,
}

impl CommandInstance {
    pub fn new(name: impl Into<String>, origin: Origin, parameters: JsonObject) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            component: String::new(),
            origin,
            state: CommandState::Queued,
            parameters,
            progress: JsonObject::new(),
            results: JsonObject::new(),
            error: None,
            observers: Vec::new(),
            queue: None,
            handler_dispatched: false,
        }
    }

    /// Shape-validate a command document: `{id?, name, component?,
    /// parameters?}`. Returns the command id found in the document even
    /// when validation fails, so cloud commands can still be aborted.
    pub fn from_json(value: &Value, origin: Origin) -> Result<Self, (DomainError, Option<String>)> {
        let object = value.as_object().ok_or((
            DomainError::ObjectExpected {
                context: "command".to_string(),
            },
            None,
        ))?;
        let id = object
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let name = object.get("name").and_then(Value::as_str).ok_or((
            DomainError::property_missing("command name is missing"),
            id.clone(),
        ))?;

        let parameters = match object.get("parameters") {
            None => JsonObject::new(),
            Some(Value::Object(params)) => params.clone(),
            Some(_) => {
                return Err((
                    DomainError::ObjectExpected {
                        context: "parameters".to_string(),
                    },
                    id,
                ))
            }
        };

        let mut instance = CommandInstance::new(name, origin, parameters);
        if let Some(id) = &id {
            instance.id = id.clone();
        }
        if let Some(component) = object.get("component").and_then(Value::as_str) {
            instance.component = component.to_string();
        }
        Ok(instance)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `trait.command` name split at the first dot.
    pub fn trait_name(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn set_component(&mut self, component: impl Into<String>) {
        self.component = component.into();
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub fn parameters(&self) -> &JsonObject {
        &self.parameters
    }

    pub fn progress(&self) -> &JsonObject {
        &self.progress
    }

    pub fn results(&self) -> &JsonObject {
        &self.results
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    pub fn to_json(&self) -> Value {
        let mut object = JsonObject::new();
        object.insert("id".to_string(), Value::String(self.id.clone()));
        object.insert("name".to_string(), Value::String(self.name.clone()));
        if !self.component.is_empty() {
            object.insert(
                "component".to_string(),
                Value::String(self.component.clone()),
            );
        }
        object.insert(
            "parameters".to_string(),
            Value::Object(self.parameters.clone()),
        );
        object.insert("progress".to_string(), Value::Object(self.progress.clone()));
        object.insert("results".to_string(), Value::Object(self.results.clone()));
        object.insert(
            "state".to_string(),
            Value::String(self.state.as_str().to_string()),
        );
        if let Some(error) = &self.error {
            object.insert("error".to_string(), error.to_json());
        }
        Value::Object(object)
    }

    fn set_status(&mut self, to: CommandState) -> Result<bool, DomainError> {
        if to == self.state {
            return Ok(false);
        }
        if to == CommandState::Queued || self.state.is_terminal() {
            return Err(DomainError::invalid_state(format!(
                "state switch impossible: '{}' -> '{}'",
                self.state.as_str(),
                to.as_str()
            )));
        }
        self.state = to;
        Ok(true)
    }
}

impl std::fmt::Debug for CommandInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandInstance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("component", &self.component)
            .field("origin", &self.origin)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Strong handle to a live command. The queue owns the only long-lived
/// strong reference; everyone else holds [`WeakCommand`].
#[derive(Clone)]
pub struct CommandRef {
    pub(crate) data: Rc<RefCell<CommandInstance>>,
}

impl CommandRef {
    pub(crate) fn new(instance: CommandInstance) -> Self {
        Self {
            data: Rc::new(RefCell::new(instance)),
        }
    }

    pub fn id(&self) -> String {
        self.data.borrow().id.clone()
    }

    pub fn name(&self) -> String {
        self.data.borrow().name.clone()
    }

    pub fn component(&self) -> String {
        self.data.borrow().component.clone()
    }

    pub fn origin(&self) -> Origin {
        self.data.borrow().origin
    }

    pub fn state(&self) -> CommandState {
        self.data.borrow().state
    }

    pub fn parameters(&self) -> JsonObject {
        self.data.borrow().parameters.clone()
    }

    pub fn progress(&self) -> JsonObject {
        self.data.borrow().progress.clone()
    }

    pub fn results(&self) -> JsonObject {
        self.data.borrow().results.clone()
    }

    pub fn error(&self) -> Option<ErrorInfo> {
        self.data.borrow().error.clone()
    }

    pub fn to_json(&self) -> Value {
        self.data.borrow().to_json()
    }

    pub fn add_observer(&self, observer: Rc<dyn Fn(CommandEvent)>) {
        self.data.borrow_mut().observers.push(observer);
    }

    pub fn downgrade(&self) -> WeakCommand {
        WeakCommand {
            data: Rc::downgrade(&self.data),
        }
    }

    /// Move to `inProgress`. The transition happens even when the new
    /// progress equals the old (a 0% -> 0% update is still progress);
    /// the progress observer only fires on an actual change.
    pub fn set_progress(&self, progress: &JsonObject) -> Result<(), DomainError> {
        let events = {
            let mut data = self.data.borrow_mut();
            let mut events = Vec::new();
            if data.set_status(CommandState::InProgress)? {
                events.push(CommandEvent::StateChanged);
            }
            if data.progress != *progress {
                data.progress = progress.clone();
                events.push(CommandEvent::ProgressChanged);
            }
            events
        };
        self.fire(&events);
        Ok(())
    }

    /// Record results and finish the command. Terminal; schedules
    /// removal from the queue after the linger interval.
    pub fn complete(&self, results: &JsonObject) -> Result<(), DomainError> {
        let events = {
            let mut data = self.data.borrow_mut();
            let mut events = Vec::new();
            if data.results != *results {
                data.results = results.clone();
                events.push(CommandEvent::ResultsChanged);
            }
            data.set_status(CommandState::Done)?;
            events.push(CommandEvent::StateChanged);
            events
        };
        self.fire(&events);
        self.schedule_removal();
        Ok(())
    }

    /// Record a recoverable failure; a later `set_progress` resumes.
    pub fn set_error(&self, error: ErrorInfo) -> Result<(), DomainError> {
        let events = {
            let mut data = self.data.borrow_mut();
            data.error = Some(error);
            let mut events = vec![CommandEvent::ErrorChanged];
            if data.set_status(CommandState::Error)? {
                events.push(CommandEvent::StateChanged);
            }
            events
        };
        self.fire(&events);
        Ok(())
    }

    pub fn pause(&self) -> Result<(), DomainError> {
        let changed = self.data.borrow_mut().set_status(CommandState::Paused)?;
        if changed {
            self.fire(&[CommandEvent::StateChanged]);
        }
        Ok(())
    }

    /// Terminal failure.
    pub fn abort(&self, error: Option<ErrorInfo>) -> Result<(), DomainError> {
        let events = {
            let mut data = self.data.borrow_mut();
            data.error = error;
            let mut events = vec![CommandEvent::ErrorChanged];
            data.set_status(CommandState::Aborted)?;
            events.push(CommandEvent::StateChanged);
            events
        };
        self.fire(&events);
        self.schedule_removal();
        Ok(())
    }

    /// Terminal cancellation by the originator.
    pub fn cancel(&self) -> Result<(), DomainError> {
        self.data.borrow_mut().set_status(CommandState::Cancelled)?;
        self.fire(&[CommandEvent::StateChanged]);
        self.schedule_removal();
        Ok(())
    }

    fn fire(&self, events: &[CommandEvent]) {
        if events.is_empty() {
            return;
        }
        let observers: Vec<Observer> = self.data.borrow().observers.clone();
        for event in events {
            for observer in &observers {
                observer(*event);
            }
        }
    }

    fn schedule_removal(&self) {
        let (queue, id) = {
            let data = self.data.borrow();
            (data.queue.clone(), data.id.clone())
        };
        if let Some(shared) = queue.and_then(|weak| weak.upgrade()) {
            shared.delayed_remove(&id);
        }
    }
}

/// Weak handle handed to command handlers and observers; holders must
/// upgrade before every use.
#[derive(Clone)]
pub struct WeakCommand {
    data: Weak<RefCell<CommandInstance>>,
}

impl WeakCommand {
    pub fn upgrade(&self) -> Option<CommandRef> {
        self.data.upgrade().map(|data| CommandRef { data })
    }
}
