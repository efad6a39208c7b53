//! Display configuration shared by every session

use lumen_protocol::{DisplayConfiguration, DisplayOutput};
use lumen_util::{LumenError, Result};
use std::collections::HashSet;
use std::io::{ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Mutex, PoisonError, RwLock};
use tracing::{debug, info};

/// Byte written to session event channels when the configuration changes
pub const DISPLAY_CHANGED_EVENT: u8 = 1;

/// A single connected 1920x1080 output
pub fn default_outputs() -> Vec<DisplayOutput> {
    vec![DisplayOutput {
        output_id: 1,
        connected: true,
        used: true,
        position_x: 0,
        position_y: 0,
        width: 1920,
        height: 1080,
        refresh_mhz: 60_000,
    }]
}

/// Check a requested configuration against the outputs that exist
pub fn validate_configuration(
    current: &[DisplayOutput],
    requested: &DisplayConfiguration,
) -> Result<()> {
    let mut seen = HashSet::new();
    for output in &requested.outputs {
        if !seen.insert(output.output_id) {
            return Err(LumenError::invalid(format!(
                "output {} listed twice",
                output.output_id
            )));
        }
        let Some(existing) = current.iter().find(|o| o.output_id == output.output_id) else {
            return Err(LumenError::invalid(format!(
                "no output with id {}",
                output.output_id
            )));
        };
        if output.used && !existing.connected {
            return Err(LumenError::invalid(format!(
                "output {} is not connected",
                output.output_id
            )));
        }
        if output.used && (output.width == 0 || output.height == 0) {
            return Err(LumenError::invalid(format!(
                "output {} has an empty mode",
                output.output_id
            )));
        }
    }
    if !requested.outputs.iter().any(|o| o.used) {
        return Err(LumenError::invalid("at least one output must stay in use"));
    }
    Ok(())
}

/// Current outputs plus the event channels to notify when they change
pub struct DisplayState {
    outputs: RwLock<Vec<DisplayOutput>>,
    listeners: Mutex<Vec<UnixStream>>,
}

impl DisplayState {
    pub fn new(outputs: Vec<DisplayOutput>) -> Self {
        Self {
            outputs: RwLock::new(outputs),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn configuration(&self) -> DisplayConfiguration {
        DisplayConfiguration {
            outputs: self
                .outputs
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            error: None,
        }
    }

    /// Validate and apply `requested`, then notify every listener
    pub fn apply(&self, requested: &DisplayConfiguration) -> Result<DisplayConfiguration> {
        {
            let mut outputs = self.outputs.write().unwrap_or_else(PoisonError::into_inner);
            validate_configuration(&outputs, requested)?;
            for update in &requested.outputs {
                if let Some(output) = outputs.iter_mut().find(|o| o.output_id == update.output_id) {
                    *output = DisplayOutput {
                        connected: output.connected,
                        ..update.clone()
                    };
                }
            }
        }
        info!(outputs = requested.outputs.len(), "Display configuration changed");
        self.notify();
        Ok(self.configuration())
    }

    /// Register the server end of a session event channel
    pub fn subscribe(&self, channel: UnixStream) -> std::io::Result<()> {
        channel.set_nonblocking(true)?;
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(channel);
        Ok(())
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Listeners whose peer is gone or not reading are dropped
    fn notify(&self) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|channel| {
            let mut channel = channel;
            match channel.write(&[DISPLAY_CHANGED_EVENT]) {
                Ok(_) => true,
                Err(e) if e.kind() == ErrorKind::WouldBlock => true,
                Err(_) => false,
            }
        });
        if listeners.len() != before {
            debug!(dropped = before - listeners.len(), "Dropped stale display listeners");
        }
    }
}

impl Default for DisplayState {
    fn default() -> Self {
        Self::new(default_outputs())
    }
}
