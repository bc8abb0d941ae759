use crate::metrics_defs::ADMISSION_DENIED;
use crate::types::ChannelId;
use parking_lot::Mutex;
use shared::counter;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("channel {channel_id} is at its limit of {limit} clients")]
    PerChannelLimitExceeded { channel_id: ChannelId, limit: u32 },
    #[error("relay is at its global limit of {limit} clients")]
    GlobalLimitExceeded { limit: u32 },
}

#[derive(Default)]
struct AdmissionState {
    // 0 means unlimited
    global_limit: u32,
    channel_limits: HashMap<ChannelId, u32>,
    in_use: HashMap<ChannelId, u32>,
    total: u32,
}

/// Counts concurrent clients per channel and globally.
///
/// The check and the increment happen under one lock, so two requests racing
/// for the last slot cannot both be admitted. A slot is held by the returned
/// [`AdmissionPermit`] until it is dropped.
#[derive(Clone, Default)]
pub struct AdmissionController {
    state: Arc<Mutex<AdmissionState>>,
}

impl AdmissionController {
    pub fn new(global_limit: u32, channel_limits: HashMap<ChannelId, u32>) -> Self {
        let controller = AdmissionController::default();
        controller.configure(global_limit, channel_limits);
        controller
    }

    /// Replaces the limits. Clients already admitted keep their slots even if
    /// the new limits are lower.
    pub fn configure(&self, global_limit: u32, channel_limits: HashMap<ChannelId, u32>) {
        let mut state = self.state.lock();
        state.global_limit = global_limit;
        state.channel_limits = channel_limits;
    }

    pub fn try_admit(&self, channel_id: &str) -> Result<AdmissionPermit, AdmissionError> {
        let mut state = self.state.lock();

        let limit = state.channel_limits.get(channel_id).copied().unwrap_or(0);
        let used = state.in_use.get(channel_id).copied().unwrap_or(0);
        if limit > 0 && used >= limit {
            counter!(ADMISSION_DENIED, "reason" => "channel").increment(1);
            return Err(AdmissionError::PerChannelLimitExceeded {
                channel_id: channel_id.to_string(),
                limit,
            });
        }

        if state.global_limit > 0 && state.total >= state.global_limit {
            counter!(ADMISSION_DENIED, "reason" => "global").increment(1);
            return Err(AdmissionError::GlobalLimitExceeded {
                limit: state.global_limit,
            });
        }

        *state.in_use.entry(channel_id.to_string()).or_default() += 1;
        state.total += 1;

        Ok(AdmissionPermit {
            controller: self.clone(),
            channel_id: channel_id.to_string(),
        })
    }

    pub fn in_use(&self, channel_id: &str) -> u32 {
        self.state.lock().in_use.get(channel_id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.state.lock().total
    }

    fn release(&self, channel_id: &str) {
        let mut state = self.state.lock();
        if let Some(count) = state.in_use.get_mut(channel_id) {
            *count -= 1;
            if *count == 0 {
                state.in_use.remove(channel_id);
            }
        }
        state.total = state.total.saturating_sub(1);
    }
}

/// One admitted client slot, released on drop.
pub struct AdmissionPermit {
    controller: AdmissionController,
    channel_id: ChannelId,
}

impl AdmissionPermit {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release(&self.channel_id);
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("channel_id", &self.channel_id)
            .finish()
    }
}
