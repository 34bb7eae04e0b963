//! Command queue: ownership, handler dispatch, delayed removal.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::debug;

use crate::command::{CommandInstance, CommandRef, WeakCommand};
use crate::provider::TaskRunner;

/// How long a terminal command stays visible before removal, so
/// observers can still read final results.
pub const COMMAND_LINGER: Duration = Duration::from_secs(60);

pub type CommandHandler = Rc<dyn Fn(WeakCommand)>;
pub type CommandCallback = Rc<dyn Fn(&CommandRef)>;

pub(crate) struct QueueShared {
    task_runner: Rc<dyn TaskRunner>,
    self_weak: Weak<QueueShared>,
    commands: RefCell<HashMap<String, CommandRef>>,
    handlers: RefCell<HashMap<(String, String), CommandHandler>>,
    on_added: RefCell<Vec<CommandCallback>>,
    on_removed: RefCell<Vec<CommandCallback>>,
}

impl QueueShared {
    pub(crate) fn delayed_remove(&self, id: &str) {
        let weak = self.self_weak.clone();
        let id = id.to_string();
        self.task_runner.post_delayed(
            COMMAND_LINGER,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.remove_now(&id);
                }
            }),
        );
    }

    fn remove_now(&self, id: &str) {
        let removed = self.commands.borrow_mut().remove(id);
        if let Some(command) = removed {
            debug!(id, "command removed from queue");
            let callbacks: Vec<_> = self.on_removed.borrow().clone();
            for callback in callbacks {
                callback(&command);
            }
        }
    }
}

/// Owns live commands keyed by id and routes each to at most one
/// handler.
pub struct CommandQueue {
    shared: Rc<QueueShared>,
}

impl CommandQueue {
    pub fn new(task_runner: Rc<dyn TaskRunner>) -> Self {
        let shared = Rc::new_cyclic(|self_weak| QueueShared {
            task_runner,
            self_weak: self_weak.clone(),
            commands: RefCell::new(HashMap::new()),
            handlers: RefCell::new(HashMap::new()),
            on_added: RefCell::new(Vec::new()),
            on_removed: RefCell::new(Vec::new()),
        });
        Self { shared }
    }

    /// Take ownership of a parsed command, announce it, and dispatch the
    /// matching handler exactly once.
    pub fn add(&self, mut instance: CommandInstance) -> CommandRef {
        assert!(!instance.id().is_empty(), "command id must be assigned");
        instance.queue = Some(Rc::downgrade(&self.shared));
        let id = instance.id().to_string();
        let command = CommandRef::new(instance);
        self.shared
            .commands
            .borrow_mut()
            .insert(id.clone(), command.clone());
        debug!(%id, name = %command.name(), "command queued");

        let callbacks: Vec<_> = self.shared.on_added.borrow().clone();
        for callback in callbacks {
            callback(&command);
        }
        self.try_dispatch(&command);
        command
    }

    pub fn find(&self, id: &str) -> Option<CommandRef> {
        self.shared.commands.borrow().get(id).cloned()
    }

    /// Register a handler for `(component, command_name)`. Both strings
    /// empty registers the default handler, which receives every command
    /// no specific handler claims. Commands already queued and unclaimed
    /// are delivered immediately.
    pub fn add_handler(&self, component: &str, command_name: &str, handler: CommandHandler) {
        let key = (component.to_string(), command_name.to_string());
        let previous = self.shared.handlers.borrow_mut().insert(key, handler);
        assert!(
            previous.is_none(),
            "duplicate handler for ('{component}', '{command_name}')"
        );

        let pending: Vec<CommandRef> = self
            .shared
            .commands
            .borrow()
            .values()
            .filter(|command| !command.data.borrow().handler_dispatched)
            .cloned()
            .collect();
        for command in pending {
            self.try_dispatch(&command);
        }
    }

    pub fn add_on_added(&self, callback: CommandCallback) {
        self.shared.on_added.borrow_mut().push(callback.clone());
        let existing: Vec<CommandRef> = self.shared.commands.borrow().values().cloned().collect();
        for command in existing {
            callback(&command);
        }
    }

    pub fn add_on_removed(&self, callback: CommandCallback) {
        self.shared.on_removed.borrow_mut().push(callback);
    }

    pub fn len(&self) -> usize {
        self.shared.commands.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.commands.borrow().is_empty()
    }

    fn try_dispatch(&self, command: &CommandRef) {
        let handler = {
            let handlers = self.shared.handlers.borrow();
            handlers
                .get(&(command.component(), command.name()))
                .or_else(|| handlers.get(&(String::new(), String::new())))
                .cloned()
        };
        if let Some(handler) = handler {
            command.data.borrow_mut().handler_dispatched = true;
            handler(command.downgrade());
        }
    }
}
