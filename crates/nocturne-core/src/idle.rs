//! Idle mode detection and ambient profiles.
//!
//! [`IdleManager`] watches the interaction timestamp from a monitor
//! thread. After the configured timeout it snapshots the parameters an
//! ambient profile touches, applies the profile, and flips
//! `idle_mode`. The first interaction afterwards restores the snapshot
//! exactly.
//!
//! Two small traits break the component cycle: the mutation engine
//! consults [`IdleGate`], and the action handler reports through
//! [`InteractionSink`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::IdleConfig;
use crate::engine::join_with_timeout;
use crate::state::{ParamValue, State};

/// Consulted by the mutation engine before every cycle.
pub trait IdleGate: Send + Sync {
    fn mutations_allowed(&self) -> bool;
}

/// Receives a ping for every inbound semantic event.
pub trait InteractionSink: Send + Sync {
    fn touch(&self);
}

/// Notified on every idle-state flip with the new state.
pub type IdleCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// A named partial override of state parameters.
#[derive(Clone, Debug)]
pub struct IdleProfile {
    pub name: &'static str,
    pub params: Vec<(&'static str, ParamValue)>,
}

/// The built-in ambient profile names.
pub fn ambient_profile_names() -> [&'static str; 3] {
    ["slow_fade", "minimal", "meditative"]
}

/// Look up a built-in ambient profile.
pub fn ambient_profile(name: &str) -> Option<IdleProfile> {
    use ParamValue as V;
    let profile = match name {
        "slow_fade" => IdleProfile {
            name: "slow_fade",
            params: vec![
                ("density", V::Float(0.3)),
                ("bpm", V::Float(65.0)),
                ("scale_index", V::Int(2)),
                ("reverb_mix", V::Int(90)),
                ("filter_cutoff", V::Int(40)),
                ("master_volume", V::Int(60)),
            ],
        },
        "minimal" => IdleProfile {
            name: "minimal",
            params: vec![
                ("density", V::Float(0.15)),
                ("bpm", V::Float(50.0)),
                ("scale_index", V::Int(2)),
                ("reverb_mix", V::Int(100)),
                ("swing", V::Float(0.05)),
                ("master_volume", V::Int(40)),
            ],
        },
        "meditative" => IdleProfile {
            name: "meditative",
            params: vec![
                ("density", V::Float(0.4)),
                ("bpm", V::Float(72.0)),
                ("scale_index", V::Int(1)),
                ("reverb_mix", V::Int(80)),
                ("filter_cutoff", V::Int(30)),
                ("swing", V::Float(0.0)),
                ("master_volume", V::Int(50)),
            ],
        },
        _ => return None,
    };
    Some(profile)
}

struct IdleInner {
    last_interaction: Instant,
    is_idle: bool,
    saved: Vec<(String, ParamValue)>,
    callbacks: Vec<IdleCallback>,
}

/// Tracks interaction and drives ambient mode.
pub struct IdleManager {
    state: Arc<State>,
    timeout: Duration,
    profile: IdleProfile,
    inner: Mutex<IdleInner>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IdleManager {
    /// The profile name was validated with the config, so an unknown
    /// name here falls back to `slow_fade`.
    pub fn new(config: &IdleConfig, state: Arc<State>) -> Self {
        let profile = ambient_profile(&config.ambient_profile)
            .unwrap_or_else(|| ambient_profile("slow_fade").unwrap());
        log::info!(
            "idle_manager_init timeout_ms={} profile={}",
            config.timeout_ms,
            profile.name
        );
        Self {
            state,
            timeout: Duration::from_millis(config.timeout_ms),
            profile,
            inner: Mutex::new(IdleInner {
                last_interaction: Instant::now(),
                is_idle: false,
                saved: Vec::new(),
                callbacks: Vec::new(),
            }),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Register an idle-state callback.
    pub fn add_idle_callback(&self, callback: IdleCallback) {
        self.inner.lock().unwrap().callbacks.push(callback);
    }

    /// Start the monitor thread (polls at 4 Hz).
    pub fn start(manager: &Arc<IdleManager>) {
        if manager.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let worker = manager.clone();
        let running = manager.running.clone();
        let handle = std::thread::Builder::new()
            .name("nocturne-idle".to_string())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    let due = {
                        let inner = worker.inner.lock().unwrap();
                        !inner.is_idle && inner.last_interaction.elapsed() >= worker.timeout
                    };
                    if due {
                        worker.enter_idle();
                    }
                    std::thread::sleep(Duration::from_millis(250));
                }
            })
            .expect("failed to spawn idle monitor");
        *manager.worker.lock().unwrap() = Some(handle);
        log::info!("idle_manager_started");
    }

    /// Stop the monitor thread.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            join_with_timeout(handle, Duration::from_secs(3), "idle monitor");
        }
        log::info!("idle_manager_stopped");
    }

    pub fn is_idle(&self) -> bool {
        self.inner.lock().unwrap().is_idle
    }

    /// Seconds since the last interaction.
    pub fn seconds_since_interaction(&self) -> f64 {
        self.inner
            .lock()
            .unwrap()
            .last_interaction
            .elapsed()
            .as_secs_f64()
    }

    /// Force entry (manual control and tests).
    pub fn force_idle(&self) {
        self.enter_idle();
    }

    /// Force exit (manual control and tests).
    pub fn force_active(&self) {
        self.exit_idle();
    }

    fn enter_idle(&self) {
        let saved: Vec<(String, ParamValue)> = {
            let mut inner = self.inner.lock().unwrap();
            if inner.is_idle {
                return;
            }
            inner.is_idle = true;
            let saved: Vec<(String, ParamValue)> = self
                .profile
                .params
                .iter()
                .filter_map(|(key, _)| self.state.get(key).map(|v| (key.to_string(), v)))
                .collect();
            inner.saved = saved.clone();
            saved
        };
        log::info!(
            "idle_mode_enter profile={} saved={}",
            self.profile.name,
            saved.len()
        );

        let updates: Vec<(&str, ParamValue)> = self
            .profile
            .params
            .iter()
            .map(|(key, value)| (*key, value.clone()))
            .collect();
        self.state.update_multiple(&updates, "idle");
        self.state.set("idle_mode", ParamValue::Bool(true), "idle");
        self.fire_callbacks(true);
    }

    fn exit_idle(&self) {
        let saved = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.is_idle {
                return;
            }
            inner.is_idle = false;
            // Fresh timestamp keeps the manager out of idle for a full
            // timeout after restore.
            inner.last_interaction = Instant::now();
            std::mem::take(&mut inner.saved)
        };
        log::info!("idle_mode_exit restored={}", saved.len());

        let updates: Vec<(&str, ParamValue)> = saved
            .iter()
            .map(|(key, value)| (key.as_str(), value.clone()))
            .collect();
        self.state.update_multiple(&updates, "idle_restore");
        self.state
            .set("idle_mode", ParamValue::Bool(false), "idle_restore");
        self.fire_callbacks(false);
    }

    fn fire_callbacks(&self, is_idle: bool) {
        let callbacks = self.inner.lock().unwrap().callbacks.clone();
        for callback in callbacks {
            callback(is_idle);
        }
    }
}

impl IdleGate for IdleManager {
    fn mutations_allowed(&self) -> bool {
        self.is_idle()
    }
}

impl InteractionSink for IdleManager {
    fn touch(&self) {
        let was_idle = {
            let mut inner = self.inner.lock().unwrap();
            inner.last_interaction = Instant::now();
            inner.is_idle
        };
        if was_idle {
            self.exit_idle();
        }
    }
}
