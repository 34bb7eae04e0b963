//! Cloud uplink: registration, OAuth upkeep, command polling, state
//! push, and the GCD connection state machine.

mod backoff;
mod push;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::command::{CommandEvent, Origin, WeakCommand};
use crate::component::{ComponentManager, UserRole};
use crate::config::Config;
use crate::error::Transience;
use crate::provider::{ConnectionState, HttpClient, Network, Request, TaskRunner};

pub use backoff::Backoff;

/// Poll cadence while connected.
const POLL_PERIOD: Duration = Duration::from_secs(7);
/// Debounce window for batching state pushes.
const STATE_PUSH_DELAY: Duration = Duration::from_secs(1);
/// Refresh the OAuth token when it is this close to expiry.
const TOKEN_EXPIRY_WINDOW: Duration = Duration::from_secs(60);
/// Consecutive transport failures tolerated before giving up.
const RETRY_BUDGET: u32 = 20;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Observable cloud-link state reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcdState {
    Unconfigured,
    Connecting,
    Connected,
    UnrecoverableError,
}

impl GcdState {
    pub fn as_str(self) -> &'static str {
        match self {
            GcdState::Unconfigured => "unconfigured",
            GcdState::Connecting => "connecting",
            GcdState::Connected => "connected",
            GcdState::UnrecoverableError => "unrecoverableError",
        }
    }
}

#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CloudError {
    #[error("network error: {0}")]
    Network(String),

    #[error("http error {status}")]
    Http { status: u16, body: String },

    #[error("oauth error '{error}': {description}")]
    OAuth { error: String, description: String },

    #[error("response is not valid json: {0}")]
    Json(String),

    #[error("device is not registered with the cloud")]
    NotRegistered,
}

impl CloudError {
    pub fn transience(&self) -> Transience {
        match self {
            CloudError::Network(_) => Transience::Retryable,
            CloudError::Http { status, .. } => match status {
                408 | 429 => Transience::Retryable,
                500..=599 => Transience::Retryable,
                _ => Transience::Permanent,
            },
            CloudError::OAuth { .. } | CloudError::Json(_) | CloudError::NotRegistered => {
                Transience::Permanent
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CloudOptions {
    /// Open the push notification channel instead of relying on the
    /// poll timer alone.
    pub xmpp_enabled: bool,
}

pub type RegisterCallback = Box<dyn FnOnce(Result<String, CloudError>)>;
type JsonCallback = Box<dyn FnOnce(Result<Value, CloudError>)>;
type TokenCallback = Box<dyn FnOnce(Result<String, CloudError>)>;

#[derive(Clone)]
struct OAuthToken {
    token: String,
    expires_at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryOp {
    Connect,
    Poll,
    StatePush,
}

/// The device's registration record and authenticated cloud session.
pub struct Cloud {
    shared: Rc<CloudShared>,
}

impl Cloud {
    pub fn new(
        config: Rc<Config>,
        components: Rc<ComponentManager>,
        task_runner: Rc<dyn TaskRunner>,
        http: Rc<dyn HttpClient>,
        network: Option<Rc<dyn Network>>,
        options: CloudOptions,
    ) -> Self {
        let shared = Rc::new(CloudShared {
            config,
            components,
            task_runner,
            http,
            network,
            options,
            state: Cell::new(GcdState::Unconfigured),
            access_token: RefCell::new(None),
            backoff: Backoff::new(BACKOFF_BASE, BACKOFF_MAX),
            failures: Cell::new(0),
            poll_generation: Cell::new(0),
            push_pending: Cell::new(false),
            full_resync: Cell::new(false),
            push_channel_open: Cell::new(false),
            on_state_changed: RefCell::new(Vec::new()),
        });
        Self { shared }
    }

    /// Wire journal and connectivity callbacks and, when registration
    /// credentials exist, start connecting.
    pub fn start(&self) {
        let shared = &self.shared;

        let weak = Rc::downgrade(shared);
        shared.components.add_state_changed_callback(Rc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.schedule_state_push();
            }
        }));

        // Cloud-origin commands mirror every lifecycle change back to the
        // server.
        let weak = Rc::downgrade(shared);
        shared
            .components
            .add_command_added_callback(Rc::new(move |command| {
                if command.origin() != Origin::Cloud {
                    return;
                }
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let weak_shared = Rc::downgrade(&shared);
                let weak_command = command.downgrade();
                command.add_observer(Rc::new(move |event| {
                    if !matches!(
                        event,
                        CommandEvent::StateChanged | CommandEvent::ProgressChanged
                    ) {
                        return;
                    }
                    if let Some(shared) = weak_shared.upgrade() {
                        shared.send_command_patch(&weak_command);
                    }
                }));
            }));

        if let Some(network) = &shared.network {
            let weak = Rc::downgrade(shared);
            network.add_connection_changed_callback(Rc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_connectivity_changed();
                }
            }));
        }

        if shared.config.with_settings(|s| s.is_registered()) {
            shared.try_connect();
        } else {
            shared.set_gcd_state(GcdState::Unconfigured);
        }
    }

    /// Enroll with the cloud using a registration ticket: ticket PATCH,
    /// finalize, then the authorization-code grant. On success the
    /// committed settings carry `cloud_id` and the refresh token, and
    /// the session is live.
    pub fn register_device(&self, ticket: &str, done: RegisterCallback) {
        self.shared.register_device(ticket, done);
    }

    pub fn gcd_state(&self) -> GcdState {
        self.shared.state.get()
    }

    /// Registering fires immediately with the current state.
    pub fn add_gcd_state_changed_callback(&self, callback: Rc<dyn Fn(GcdState)>) {
        callback(self.shared.state.get());
        self.shared.on_state_changed.borrow_mut().push(callback);
    }

    /// Poll for queued commands now instead of waiting for the timer.
    pub fn check_for_commands(&self) {
        self.shared.poll_now();
    }
}

struct CloudShared {
    config: Rc<Config>,
    components: Rc<ComponentManager>,
    task_runner: Rc<dyn TaskRunner>,
    http: Rc<dyn HttpClient>,
    network: Option<Rc<dyn Network>>,
    options: CloudOptions,
    state: Cell<GcdState>,
    access_token: RefCell<Option<OAuthToken>>,
    backoff: Backoff,
    failures: Cell<u32>,
    poll_generation: Cell<u64>,
    push_pending: Cell<bool>,
    full_resync: Cell<bool>,
    push_channel_open: Cell<bool>,
    on_state_changed: RefCell<Vec<Rc<dyn Fn(GcdState)>>>,
}

impl CloudShared {
    fn now(&self) -> SystemTime {
        self.task_runner.clock().now()
    }

    fn now_millis(&self) -> u64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn network_online(&self) -> bool {
        self.network
            .as_ref()
            .map(|network| network.connection_state() == ConnectionState::Connected)
            .unwrap_or(true)
    }

    fn set_gcd_state(&self, state: GcdState) {
        if self.state.get() == state {
            return;
        }
        info!(from = self.state.get().as_str(), to = state.as_str(), "gcd state");
        self.state.set(state);
        let callbacks: Vec<_> = self.on_state_changed.borrow().clone();
        for callback in callbacks {
            callback(state);
        }
    }

    // ---- registration ----

    fn register_device(self: &Rc<Self>, ticket: &str, done: RegisterCallback) {
        let settings = self.config.settings();
        if !settings.is_registered() {
            self.set_gcd_state(GcdState::Connecting);
        }
        let draft = json!({
            "name": settings.name,
            "description": settings.description,
            "location": settings.location,
            "modelManifestId": settings.model_id,
            "deviceKind": "vendor",
            "channel": {"supportedType": "pull"},
            "traits": self.components.traits(),
            "components": self.components.components(),
        });
        let body = json!({
            "id": ticket,
            "oauthClientId": settings.client_id,
            "deviceDraft": draft,
        });
        let url = format!(
            "{}registrationTickets/{}?key={}",
            settings.service_url, ticket, settings.api_key
        );
        let finalize_url = format!(
            "{}registrationTickets/{}/finalize?key={}",
            settings.service_url, ticket, settings.api_key
        );

        let weak = Rc::downgrade(self);
        self.send_json(
            Request::new("PATCH", url).json_body(&body),
            Box::new(move |result| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let response = match result {
                    Ok(response) => response,
                    Err(err) => {
                        shared.abandon_registration();
                        return done(Err(err));
                    }
                };
                let Some(cloud_id) = response
                    .get("deviceId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                else {
                    shared.abandon_registration();
                    return done(Err(CloudError::Json(
                        "registration response carries no deviceId".to_string(),
                    )));
                };
                shared.finalize_registration(finalize_url, cloud_id, done);
            }),
        );
    }

    fn finalize_registration(
        self: &Rc<Self>,
        finalize_url: String,
        cloud_id: String,
        done: RegisterCallback,
    ) {
        let weak = Rc::downgrade(self);
        self.send_json(
            Request::new("POST", finalize_url),
            Box::new(move |result| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let response = match result {
                    Ok(response) => response,
                    Err(err) => {
                        shared.abandon_registration();
                        return done(Err(err));
                    }
                };
                let robot_account = response
                    .get("robotAccountEmail")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let Some(auth_code) = response
                    .get("robotAccountAuthorizationCode")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                else {
                    shared.abandon_registration();
                    return done(Err(CloudError::Json(
                        "finalize response carries no authorization code".to_string(),
                    )));
                };
                shared.redeem_authorization_code(cloud_id, robot_account, auth_code, done);
            }),
        );
    }

    fn redeem_authorization_code(
        self: &Rc<Self>,
        cloud_id: String,
        robot_account: String,
        auth_code: String,
        done: RegisterCallback,
    ) {
        let settings = self.config.settings();
        let request = Request::new("POST", format!("{}token", settings.oauth_url)).form_body(&[
            ("grant_type", "authorization_code"),
            ("code", auth_code.as_str()),
            ("client_id", settings.client_id.as_str()),
            ("client_secret", settings.client_secret.as_str()),
            ("redirect_uri", "oob"),
        ]);
        let weak = Rc::downgrade(self);
        self.http.send_request(
            request,
            Box::new(move |result| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let grant = match shared.handle_oauth_response(result) {
                    Ok(grant) => grant,
                    Err(err) => {
                        shared.abandon_registration();
                        return done(Err(err));
                    }
                };
                let refresh_token = grant
                    .get("refresh_token")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                {
                    let mut tx = shared.config.edit();
                    tx.set_cloud_id(cloud_id.clone());
                    tx.set_robot_account(robot_account.clone());
                    tx.set_refresh_token(refresh_token);
                    tx.commit();
                }
                info!(%cloud_id, "device registered");
                shared.on_session_established();
                done(Ok(cloud_id));
            }),
        );
    }

    fn abandon_registration(&self) {
        if !self.config.with_settings(|s| s.is_registered()) {
            self.set_gcd_state(GcdState::Unconfigured);
        }
    }

    // ---- oauth ----

    /// Parse a token-endpoint response, caching the access token on
    /// success. An explicit OAuth refusal is unrecoverable.
    fn handle_oauth_response(
        self: &Rc<Self>,
        result: Result<crate::provider::Response, crate::provider::TransportError>,
    ) -> Result<Value, CloudError> {
        let response = result.map_err(|err| CloudError::Network(err.message))?;
        if response.is_success() {
            let grant = response
                .json()
                .map_err(|err| CloudError::Json(err.to_string()))?;
            let Some(token) = grant.get("access_token").and_then(Value::as_str) else {
                return Err(CloudError::Json(
                    "token response carries no access_token".to_string(),
                ));
            };
            let expires_in = grant
                .get("expires_in")
                .and_then(Value::as_u64)
                .unwrap_or(3600);
            *self.access_token.borrow_mut() = Some(OAuthToken {
                token: token.to_string(),
                expires_at: self.now() + Duration::from_secs(expires_in),
            });
            return Ok(grant);
        }
        if let Ok(body) = response.json() {
            if let Some(error) = body.get("error").and_then(Value::as_str) {
                let err = CloudError::OAuth {
                    error: error.to_string(),
                    description: body
                        .get("error_description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                };
                warn!(%err, "oauth grant refused");
                self.set_gcd_state(GcdState::UnrecoverableError);
                return Err(err);
            }
        }
        Err(CloudError::Http {
            status: response.status,
            body: response.body,
        })
    }

    fn with_access_token(self: &Rc<Self>, done: TokenCallback) {
        let cached = self.access_token.borrow().clone();
        if let Some(cached) = cached {
            if cached.expires_at > self.now() + TOKEN_EXPIRY_WINDOW {
                return done(Ok(cached.token));
            }
        }
        self.refresh_access_token(done);
    }

    fn refresh_access_token(self: &Rc<Self>, done: TokenCallback) {
        let settings = self.config.settings();
        if settings.refresh_token.is_empty() {
            return done(Err(CloudError::NotRegistered));
        }
        debug!("refreshing oauth access token");
        let request = Request::new("POST", format!("{}token", settings.oauth_url)).form_body(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", settings.refresh_token.as_str()),
            ("client_id", settings.client_id.as_str()),
            ("client_secret", settings.client_secret.as_str()),
        ]);
        let weak = Rc::downgrade(self);
        self.http.send_request(
            request,
            Box::new(move |result| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let outcome = shared
                    .handle_oauth_response(result)
                    .map(|_| match &*shared.access_token.borrow() {
                        Some(token) => token.token.clone(),
                        None => String::new(),
                    });
                done(outcome);
            }),
        );
    }

    // ---- authenticated requests ----

    fn send_json(&self, request: Request, done: JsonCallback) {
        self.http.send_request(
            request,
            Box::new(move |result| {
                done(
                    result
                        .map_err(|err| CloudError::Network(err.message))
                        .and_then(|response| {
                            if response.is_success() {
                                response
                                    .json()
                                    .map_err(|err| CloudError::Json(err.to_string()))
                            } else {
                                Err(CloudError::Http {
                                    status: response.status,
                                    body: response.body,
                                })
                            }
                        }),
                )
            }),
        );
    }

    /// Send an authenticated request; a 401 invalidates the cached token
    /// and retries exactly once with a fresh one.
    fn request_with_auth(
        self: &Rc<Self>,
        method: &'static str,
        url: String,
        body: Option<Value>,
        retried: bool,
        done: JsonCallback,
    ) {
        let weak = Rc::downgrade(self);
        self.with_access_token(Box::new(move |token| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let token = match token {
                Ok(token) => token,
                Err(err) => return done(Err(err)),
            };
            let mut request = Request::new(method, url.clone())
                .header("Authorization", format!("Bearer {token}"));
            if let Some(body) = &body {
                request = request.json_body(body);
            }
            let weak = Rc::downgrade(&shared);
            shared.http.send_request(
                request,
                Box::new(move |result| {
                    let Some(shared) = weak.upgrade() else {
                        return;
                    };
                    match result {
                        Err(err) => done(Err(CloudError::Network(err.message))),
                        Ok(response) if response.status == 401 && !retried => {
                            debug!("access token rejected, refreshing once");
                            shared.access_token.borrow_mut().take();
                            shared.request_with_auth(method, url, body, true, done);
                        }
                        Ok(response) if response.is_success() => {
                            done(
                                response
                                    .json()
                                    .map_err(|err| CloudError::Json(err.to_string())),
                            );
                        }
                        Ok(response) => done(Err(CloudError::Http {
                            status: response.status,
                            body: response.body,
                        })),
                    }
                }),
            );
        }));
    }

    // ---- session lifecycle ----

    fn on_session_established(self: &Rc<Self>) {
        self.failures.set(0);
        self.backoff.reset();
        self.set_gcd_state(GcdState::Connected);
        self.start_polling();
        self.schedule_state_push();
        self.open_push_channel();
    }

    fn try_connect(self: &Rc<Self>) {
        if !self.config.with_settings(|s| s.is_registered()) {
            self.set_gcd_state(GcdState::Unconfigured);
            return;
        }
        if !self.network_online() {
            return;
        }
        self.set_gcd_state(GcdState::Connecting);
        let weak = Rc::downgrade(self);
        self.with_access_token(Box::new(move |result| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(_) => shared.on_session_established(),
                Err(err) => shared.on_cloud_failure(err, RetryOp::Connect),
            }
        }));
    }

    fn on_connectivity_changed(self: &Rc<Self>) {
        if self.network_online() {
            debug!("network online");
            self.try_connect();
        } else {
            debug!("network offline, suspending cloud traffic");
            self.stop_polling();
            if self.state.get() == GcdState::Connected {
                self.set_gcd_state(GcdState::Connecting);
            }
        }
    }

    fn open_push_channel(self: &Rc<Self>) {
        if !self.options.xmpp_enabled || self.push_channel_open.get() {
            return;
        }
        let Some(network) = &self.network else {
            return;
        };
        self.push_channel_open.set(true);
        let weak = Rc::downgrade(self);
        push::open_push_channel(
            network,
            Rc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.poll_now();
                }
            }),
        );
    }

    // ---- command polling ----

    fn stop_polling(&self) {
        self.poll_generation.set(self.poll_generation.get() + 1);
    }

    fn start_polling(self: &Rc<Self>) {
        self.stop_polling();
        self.poll_now();
    }

    fn schedule_poll(self: &Rc<Self>, delay: Duration) {
        let generation = self.poll_generation.get();
        let weak = Rc::downgrade(self);
        self.task_runner.post_delayed(
            delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    if shared.poll_generation.get() == generation {
                        shared.poll_now();
                    }
                }
            }),
        );
    }

    fn poll_now(self: &Rc<Self>) {
        let settings = self.config.settings();
        if !settings.is_registered() || !self.network_online() {
            return;
        }
        let url = format!(
            "{}devices/{}/commands?state=queued&key={}",
            settings.service_url, settings.cloud_id, settings.api_key
        );
        let weak = Rc::downgrade(self);
        self.request_with_auth(
            "GET",
            url,
            None,
            false,
            Box::new(move |result| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(response) => {
                        shared.on_cloud_success();
                        if let Some(commands) =
                            response.get("commands").and_then(Value::as_array)
                        {
                            for command in commands {
                                shared.handle_cloud_command(command);
                            }
                        }
                        shared.schedule_poll(POLL_PERIOD);
                    }
                    Err(err) => shared.on_cloud_failure(err, RetryOp::Poll),
                }
            }),
        );
    }

    fn handle_cloud_command(self: &Rc<Self>, document: &Value) {
        if let Some(id) = document.get("id").and_then(Value::as_str) {
            if self.components.find_command(id).is_some() {
                return;
            }
        }
        match self
            .components
            .parse_command_instance(document, Origin::Cloud, UserRole::Owner)
        {
            Ok(instance) => {
                debug!(id = instance.id(), name = instance.name(), "cloud command accepted");
                self.components.add_command(instance);
            }
            Err(parse_error) => {
                warn!(error = %parse_error.error, "rejecting cloud command");
                // Commands that carried an id are aborted server-side so
                // they stop being delivered.
                if let Some(id) = parse_error.command_id {
                    let body = json!({
                        "state": "aborted",
                        "error": {
                            "code": parse_error.error.code(),
                            "message": parse_error.error.to_string(),
                        },
                    });
                    self.patch_command(&id, body);
                }
            }
        }
    }

    fn send_command_patch(self: &Rc<Self>, command: &WeakCommand) {
        let Some(command) = command.upgrade() else {
            return;
        };
        let mut body = json!({
            "state": command.state().as_str(),
            "progress": command.progress(),
            "results": command.results(),
        });
        if let Some(error) = command.error() {
            body["error"] = error.to_json();
        }
        self.patch_command(&command.id(), body);
    }

    fn patch_command(self: &Rc<Self>, id: &str, body: Value) {
        let settings = self.config.settings();
        if !settings.is_registered() {
            return;
        }
        let url = format!(
            "{}commands/{}?key={}",
            settings.service_url, id, settings.api_key
        );
        let id = id.to_string();
        self.request_with_auth(
            "PATCH",
            url,
            Some(body),
            false,
            Box::new(move |result| {
                if let Err(err) = result {
                    warn!(%id, %err, "command patch failed");
                }
            }),
        );
    }

    // ---- state push ----

    fn schedule_state_push(self: &Rc<Self>) {
        if !self.config.with_settings(|s| s.is_registered()) {
            return;
        }
        if self.push_pending.replace(true) {
            return;
        }
        let weak = Rc::downgrade(self);
        self.task_runner.post_delayed(
            STATE_PUSH_DELAY,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.push_pending.set(false);
                    shared.push_states_now();
                }
            }),
        );
    }

    fn push_states_now(self: &Rc<Self>) {
        let settings = self.config.settings();
        if !settings.is_registered() || !self.network_online() {
            return;
        }
        let snapshot = self.components.get_and_clear_recorded_state_changes();
        let mut patches = Vec::new();
        if self.full_resync.get() {
            // A failed push already drained the journal; send the whole
            // current state instead of replaying lost patches.
            if let Some(components) = self.components.components().as_object() {
                for (name, component) in components {
                    if let Some(state) = component.get("state") {
                        patches.push(json!({
                            "timeMs": self.now_millis(),
                            "component": name,
                            "patch": state,
                        }));
                    }
                }
            }
        } else {
            for change in &snapshot.state_changes {
                let time_ms = change
                    .timestamp
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                patches.push(json!({
                    "timeMs": time_ms,
                    "component": change.component,
                    "patch": change.changed_properties,
                }));
            }
        }
        if patches.is_empty() {
            return;
        }
        let body = json!({
            "requestTimeMs": self.now_millis(),
            "patches": patches,
        });
        let url = format!(
            "{}devices/{}/patchState?key={}",
            settings.service_url, settings.cloud_id, settings.api_key
        );
        let update_id = snapshot.update_id;
        let weak = Rc::downgrade(self);
        self.request_with_auth(
            "POST",
            url,
            Some(body),
            false,
            Box::new(move |result| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(_) => {
                        shared.full_resync.set(false);
                        shared.on_cloud_success();
                        shared.components.notify_state_updated_on_server(update_id);
                    }
                    Err(err) => {
                        shared.full_resync.set(true);
                        shared.on_cloud_failure(err, RetryOp::StatePush);
                    }
                }
            }),
        );
    }

    // ---- failure policy ----

    fn on_cloud_success(&self) {
        self.failures.set(0);
        self.backoff.reset();
        self.set_gcd_state(GcdState::Connected);
    }

    fn on_cloud_failure(self: &Rc<Self>, err: CloudError, op: RetryOp) {
        warn!(%err, ?op, "cloud request failed");
        if matches!(err, CloudError::OAuth { .. }) {
            // handle_oauth_response already marked the link dead.
            return;
        }
        if err.transience() != Transience::Retryable {
            if op == RetryOp::Poll {
                self.schedule_poll(POLL_PERIOD);
            }
            return;
        }
        let failures = self.failures.get() + 1;
        self.failures.set(failures);
        if failures >= RETRY_BUDGET {
            self.set_gcd_state(GcdState::UnrecoverableError);
            self.stop_polling();
            return;
        }
        if self.state.get() == GcdState::Connected {
            self.set_gcd_state(GcdState::Connecting);
        }
        let delay = self.backoff.next_delay();
        debug!(?delay, failures, "backing off");
        let weak = Rc::downgrade(self);
        match op {
            RetryOp::Poll => self.schedule_poll(delay),
            RetryOp::Connect => self.task_runner.post_delayed(
                delay,
                Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.try_connect();
                    }
                }),
            ),
            RetryOp::StatePush => self.task_runner.post_delayed(
                delay,
                Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.schedule_state_push();
                    }
                }),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use serde_json::json;

    use super::*;
    use crate::command::JsonObject;
    use crate::config::Settings;
    use crate::provider::test::{FakeHttpClient, FakeNetwork, FakeTaskRunner, MemConfigStore};

    const SERVICE: &str = "https://www.googleapis.com/clouddevices/v1/";

    fn factory_defaults() -> Settings {
        Settings {
            device_id: "TEST_DEVICE_ID".to_string(),
            name: "TEST_NAME".to_string(),
            model_id: "ABCDE".to_string(),
            api_key: "TEST_API_KEY".to_string(),
            client_id: "TEST_CLIENT_ID".to_string(),
            client_secret: "TEST_CLIENT_SECRET".to_string(),
            ..Settings::default()
        }
    }

    struct Fixture {
        runner: Rc<FakeTaskRunner>,
        http: Rc<FakeHttpClient>,
        config: Rc<Config>,
        components: Rc<ComponentManager>,
        cloud: Cloud,
    }

    fn fixture(registered: bool, options: CloudOptions, network: Option<Rc<FakeNetwork>>) -> Fixture {
        let runner = FakeTaskRunner::new();
        let http = FakeHttpClient::new();
        let store = MemConfigStore::with_defaults(factory_defaults());
        if registered {
            store.seed(
                "settings",
                r#"{"cloud_id": "CLOUD_ID", "refresh_token": "REFRESH_TOKEN", "robot_account": "ROBO@gmail.com"}"#,
            );
        }
        let config = Rc::new(Config::new(Some(store)));
        let components = Rc::new(ComponentManager::new(runner.clone()));
        let cloud = Cloud::new(
            config.clone(),
            components.clone(),
            runner.clone(),
            http.clone(),
            network.map(|n| n as Rc<dyn Network>),
            options,
        );
        Fixture {
            runner,
            http,
            config,
            components,
            cloud,
        }
    }

    fn expect_token_grant(http: &FakeHttpClient, token: &str) {
        http.expect(
            "POST",
            "https://accounts.google.com/o/oauth2/token",
            200,
            &format!(
                r#"{{"access_token": "{token}", "token_type": "Bearer", "expires_in": 3599, "refresh_token": "REFRESH_TOKEN"}}"#
            ),
        );
    }

    fn expect_empty_poll(http: &FakeHttpClient) {
        http.expect(
            "GET",
            &format!("{SERVICE}devices/CLOUD_ID/commands?state=queued&key=TEST_API_KEY"),
            200,
            r#"{"commands": []}"#,
        );
    }

    #[test]
    fn registration_end_to_end() {
        let f = fixture(false, CloudOptions::default(), None);
        assert_eq!(f.cloud.gcd_state(), GcdState::Unconfigured);

        f.http.expect(
            "PATCH",
            &format!("{SERVICE}registrationTickets/TICKET_ID?key=TEST_API_KEY"),
            200,
            r#"{"id": "TICKET_ID", "deviceId": "CLOUD_ID", "oauthClientId": "CLIENT_ID"}"#,
        );
        f.http.expect(
            "POST",
            &format!("{SERVICE}registrationTickets/TICKET_ID/finalize?key=TEST_API_KEY"),
            200,
            r#"{"id": "TICKET_ID", "deviceId": "CLOUD_ID", "robotAccountEmail": "ROBO@gmail.com", "robotAccountAuthorizationCode": "AUTH_CODE"}"#,
        );
        f.http.expect(
            "POST",
            "https://accounts.google.com/o/oauth2/token",
            200,
            r#"{"access_token": "ACCESS_TOKEN", "token_type": "Bearer", "expires_in": 3599, "refresh_token": "REFRESH_TOKEN"}"#,
        );
        expect_empty_poll(&f.http);

        let outcome = Rc::new(RefCell::new(None));
        let sink = outcome.clone();
        f.cloud.register_device(
            "TICKET_ID",
            Box::new(move |result| *sink.borrow_mut() = Some(result)),
        );

        assert_eq!(
            outcome.borrow().as_ref().unwrap().as_ref().unwrap(),
            "CLOUD_ID"
        );
        let settings = f.config.settings();
        assert_eq!(settings.cloud_id, "CLOUD_ID");
        assert_eq!(settings.refresh_token, "REFRESH_TOKEN");
        assert_eq!(settings.robot_account, "ROBO@gmail.com");
        assert_eq!(f.cloud.gcd_state(), GcdState::Connected);

        let requests = f.http.requests();
        let draft_body: Value =
            serde_json::from_slice(requests[0].body.as_ref().unwrap()).unwrap();
        assert_eq!(draft_body["deviceDraft"]["name"], "TEST_NAME");
        assert_eq!(draft_body["deviceDraft"]["modelManifestId"], "ABCDE");
        let oauth_body = String::from_utf8(requests[2].body.clone().unwrap()).unwrap();
        assert!(oauth_body.contains("grant_type=authorization_code"));
        assert!(oauth_body.contains("code=AUTH_CODE"));
        assert_eq!(f.http.unmet_expectations(), 0);
    }

    #[test]
    fn expired_token_refreshes_and_retries_on_401() {
        let f = fixture(true, CloudOptions::default(), None);
        expect_token_grant(&f.http, "STALE_TOKEN");
        f.http.expect(
            "GET",
            &format!("{SERVICE}devices/CLOUD_ID/commands?state=queued&key=TEST_API_KEY"),
            401,
            r#"{}"#,
        );
        expect_token_grant(&f.http, "FRESH_TOKEN");
        expect_empty_poll(&f.http);

        f.cloud.check_for_commands();

        let requests = f.http.requests();
        let auth_header = requests
            .last()
            .unwrap()
            .headers
            .iter()
            .find(|(name, _)| name == "Authorization")
            .map(|(_, value)| value.clone());
        assert_eq!(auth_header.as_deref(), Some("Bearer FRESH_TOKEN"));
        assert_eq!(f.cloud.gcd_state(), GcdState::Connected);
        assert_eq!(f.http.unmet_expectations(), 0);
    }

    #[test]
    fn oauth_refusal_is_unrecoverable() {
        let f = fixture(true, CloudOptions::default(), None);
        f.http.expect(
            "POST",
            "https://accounts.google.com/o/oauth2/token",
            400,
            r#"{"error": "invalid_grant"}"#,
        );
        f.cloud.check_for_commands();
        assert_eq!(f.cloud.gcd_state(), GcdState::UnrecoverableError);
    }

    #[test]
    fn transport_failure_backs_off_then_recovers() {
        let f = fixture(true, CloudOptions::default(), None);
        expect_token_grant(&f.http, "ACCESS_TOKEN");
        f.http.expect_transport_error(
            "GET",
            &format!("{SERVICE}devices/CLOUD_ID/commands?state=queued&key=TEST_API_KEY"),
            "connection reset",
        );
        f.cloud.start();
        assert_eq!(f.cloud.gcd_state(), GcdState::Connecting);
        assert!(f.runner.pending() >= 1);

        // The retry poll succeeds and the link recovers.
        expect_empty_poll(&f.http);
        f.runner.run_for(Duration::from_secs(2));
        assert_eq!(f.cloud.gcd_state(), GcdState::Connected);
        assert_eq!(f.http.unmet_expectations(), 0);
    }

    #[test]
    fn state_changes_push_after_debounce_and_ack() {
        let f = fixture(true, CloudOptions::default(), None);
        f.components
            .load_traits(&json!({"power": {"state": {"level": {"type": "integer"}}}}))
            .unwrap();
        f.components.add_component("", "battery", &["power"]).unwrap();

        // try_connect during start completes synchronously.
        expect_token_grant(&f.http, "ACCESS_TOKEN");
        expect_empty_poll(&f.http);
        f.cloud.start();

        let acked = Rc::new(RefCell::new(Vec::new()));
        let sink = acked.clone();
        f.components
            .add_server_state_updated_callback(Rc::new(move |id| sink.borrow_mut().push(id)));

        f.components
            .set_state_property("battery", "power.level", json!(42))
            .unwrap();
        f.components
            .set_state_property("battery", "power.level", json!(43))
            .unwrap();

        f.http.expect(
            "POST",
            &format!("{SERVICE}devices/CLOUD_ID/patchState?key=TEST_API_KEY"),
            200,
            r#"{}"#,
        );
        f.runner.run_for(Duration::from_secs(2));

        assert!(acked.borrow().contains(&2));
        let requests = f.http.requests();
        let push_body: Value =
            serde_json::from_slice(requests.last().unwrap().body.as_ref().unwrap()).unwrap();
        let patches = push_body["patches"].as_array().unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0]["component"], "battery");
        assert_eq!(patches[1]["patch"]["power"]["level"], 43);
        assert_eq!(f.http.unmet_expectations(), 0);
    }

    #[test]
    fn failed_push_resyncs_full_state() {
        let f = fixture(true, CloudOptions::default(), None);
        f.components
            .load_traits(&json!({"power": {"state": {"level": {"type": "integer"}}}}))
            .unwrap();
        f.components.add_component("", "battery", &["power"]).unwrap();
        expect_token_grant(&f.http, "ACCESS_TOKEN");
        expect_empty_poll(&f.http);
        f.cloud.start();

        f.components
            .set_state_property("battery", "power.level", json!(42))
            .unwrap();
        f.http.expect_transport_error(
            "POST",
            &format!("{SERVICE}devices/CLOUD_ID/patchState?key=TEST_API_KEY"),
            "connection reset",
        );
        f.runner.run_for(Duration::from_secs(2));

        // The retry carries the full state snapshot, not the lost patch.
        f.http.expect(
            "POST",
            &format!("{SERVICE}devices/CLOUD_ID/patchState?key=TEST_API_KEY"),
            200,
            r#"{}"#,
        );
        f.runner.run_for(Duration::from_secs(5));
        let requests = f.http.requests();
        let push_body: Value =
            serde_json::from_slice(requests.last().unwrap().body.as_ref().unwrap()).unwrap();
        assert_eq!(
            push_body["patches"][0]["patch"]["power"]["level"],
            42
        );
        assert_eq!(f.http.unmet_expectations(), 0);
    }

    #[test]
    fn cloud_command_lifecycle_patches_back() {
        let f = fixture(true, CloudOptions::default(), None);
        f.components
            .load_traits(&json!({
                "base": {"commands": {"identify": {"minimalRole": "user", "parameters": {}}}}
            }))
            .unwrap();
        f.components.add_component("", "base", &["base"]).unwrap();

        expect_token_grant(&f.http, "ACCESS_TOKEN");
        f.http.expect(
            "GET",
            &format!("{SERVICE}devices/CLOUD_ID/commands?state=queued&key=TEST_API_KEY"),
            200,
            r#"{"commands": [{"id": "10", "name": "base.identify", "parameters": {}}]}"#,
        );
        // The handler registered below completes synchronously: one
        // terminal patch goes out.
        f.http.expect(
            "PATCH",
            &format!("{SERVICE}commands/10?key=TEST_API_KEY"),
            200,
            r#"{}"#,
        );
        f.cloud.start();

        f.components.add_command_handler(
            "base",
            "base.identify",
            Rc::new(|command| {
                let command = command.upgrade().unwrap();
                command.complete(&JsonObject::new()).unwrap();
            }),
        );

        let requests = f.http.requests();
        let patch: Value =
            serde_json::from_slice(requests.last().unwrap().body.as_ref().unwrap()).unwrap();
        assert_eq!(patch["state"], "done");
        assert_eq!(f.http.unmet_expectations(), 0);

        // A re-delivered command id is ignored while still in the queue.
        f.http.expect(
            "GET",
            &format!("{SERVICE}devices/CLOUD_ID/commands?state=queued&key=TEST_API_KEY"),
            200,
            r#"{"commands": [{"id": "10", "name": "base.identify", "parameters": {}}]}"#,
        );
        f.cloud.check_for_commands();
        assert_eq!(f.http.unmet_expectations(), 0);
    }

    #[test]
    fn invalid_cloud_command_is_aborted_upstream() {
        let f = fixture(true, CloudOptions::default(), None);
        expect_token_grant(&f.http, "ACCESS_TOKEN");
        f.http.expect(
            "GET",
            &format!("{SERVICE}devices/CLOUD_ID/commands?state=queued&key=TEST_API_KEY"),
            200,
            r#"{"commands": [{"id": "66", "name": "ghost.cmd"}]}"#,
        );
        f.http.expect(
            "PATCH",
            &format!("{SERVICE}commands/66?key=TEST_API_KEY"),
            200,
            r#"{}"#,
        );
        f.cloud.start();

        let requests = f.http.requests();
        let patch: Value =
            serde_json::from_slice(requests.last().unwrap().body.as_ref().unwrap()).unwrap();
        assert_eq!(patch["state"], "aborted");
        assert_eq!(patch["error"]["code"], "invalid_command_name");
        assert_eq!(f.http.unmet_expectations(), 0);
    }

    #[test]
    fn offline_network_suspends_polling_until_reconnect() {
        let network = FakeNetwork::new(ConnectionState::Connected);
        let f = fixture(true, CloudOptions::default(), Some(network.clone()));
        expect_token_grant(&f.http, "ACCESS_TOKEN");
        expect_empty_poll(&f.http);
        f.cloud.start();
        assert_eq!(f.cloud.gcd_state(), GcdState::Connected);

        network.notify_changed(&*f.runner, ConnectionState::Offline, Duration::ZERO);
        f.runner.run_for(Duration::from_millis(1));
        assert_eq!(f.cloud.gcd_state(), GcdState::Connecting);

        // The poll timer from the connected period must not fire while
        // offline: no expectations are queued, so a poll would panic.
        f.runner.run_for(Duration::from_secs(30));

        expect_empty_poll(&f.http);
        network.notify_changed(&*f.runner, ConnectionState::Connected, Duration::ZERO);
        f.runner.run_for(Duration::from_millis(1));
        assert_eq!(f.cloud.gcd_state(), GcdState::Connected);
        assert_eq!(f.http.unmet_expectations(), 0);
    }

    #[test]
    fn push_channel_short_circuits_the_poll() {
        let network = FakeNetwork::new(ConnectionState::Connected);
        let f = fixture(
            true,
            CloudOptions { xmpp_enabled: true },
            Some(network.clone()),
        );
        expect_token_grant(&f.http, "ACCESS_TOKEN");
        expect_empty_poll(&f.http);
        f.cloud.start();
        assert_eq!(network.opened_sockets(), vec![("talk.google.com".to_string(), 5223)]);

        expect_empty_poll(&f.http);
        network.feed_socket_data(b"<message/>");
        assert_eq!(f.http.unmet_expectations(), 0);
    }
}
