use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::stages::{ModelStage, StageError};

/// Accelerator memory class of the host.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum HardwareProfile {
    /// Room for one model at a time: every stage unloads after use.
    #[default]
    Constrained,
    /// Room for every model at once: preload at startup, never unload.
    Ample,
}

impl HardwareProfile {
    pub fn models_stay_in_memory(self) -> bool {
        matches!(self, HardwareProfile::Ample)
    }
}

/// Enforces the accelerator memory budget around model-bearing stages.
///
/// A single-slot semaphore stands for "a model is resident". It is acquired
/// before `load()` and released once the stage is done and, under the
/// constrained profile, after `unload()`. This serializes model-bearing work
/// across the whole process while non-model steps of other tasks keep
/// running.
#[derive(Debug, Clone)]
pub struct ResourceGovernor {
    resident: Arc<Semaphore>,
    profile: HardwareProfile,
}

impl ResourceGovernor {
    pub fn new(profile: HardwareProfile) -> Self {
        Self {
            resident: Arc::new(Semaphore::new(1)),
            profile,
        }
    }

    pub fn profile(&self) -> HardwareProfile {
        self.profile
    }

    pub fn models_stay_in_memory(&self) -> bool {
        self.profile.models_stay_in_memory()
    }

    /// Run `work` against `model` under the memory policy.
    ///
    /// The model is loaded lazily if needed. Under the constrained profile it
    /// is unloaded afterwards no matter how `work` ended; an unload failure is
    /// logged and never replaces the stage's own result.
    ///
    /// The call returns only once `work` has returned, so the model is never
    /// left loaded behind a finished call. Time limits belong to the stage
    /// itself (request timeouts of the remote clients).
    pub async fn guard<M, T, F>(&self, model: Arc<M>, work: F) -> Result<T, StageError>
    where
        M: ModelStage + ?Sized,
        T: Send + 'static,
        F: FnOnce(&M) -> Result<T, StageError> + Send + 'static,
    {
        let permit = Arc::clone(&self.resident)
            .acquire_owned()
            .await
            .map_err(|_| StageError::Unavailable("resource governor closed".to_owned()))?;

        let stay_resident = self.models_stay_in_memory();
        let name = model.name().to_owned();

        let handle = tokio::task::spawn_blocking(move || {
            let _slot = ResidentSlot {
                model: Arc::clone(&model),
                unload: !stay_resident,
                _permit: permit,
            };
            if !model.is_loaded() {
                debug!(model = %model.name(), "loading model");
                model.load()?;
            }
            work(&*model)
        });

        handle
            .await
            .map_err(|e| StageError::Inference(format!("{name} worker panicked: {e}")))?
    }

    /// Load `model` ahead of time. Only meaningful under the ample profile;
    /// otherwise it is a no-op so lazy loading stays in charge.
    pub async fn preload<M>(&self, model: Arc<M>) -> Result<(), StageError>
    where
        M: ModelStage + ?Sized,
    {
        if !self.models_stay_in_memory() {
            return Ok(());
        }
        let name = model.name().to_owned();
        tokio::task::spawn_blocking(move || model.load())
            .await
            .map_err(|e| StageError::Load(format!("{name} preload panicked: {e}")))??;
        info!(model = %name, "model preloaded");
        Ok(())
    }
}

/// Releases the resident slot when the blocking work finishes, unloading the
/// model first when the profile asks for it. Runs on unwind too.
struct ResidentSlot<M: ModelStage + ?Sized> {
    model: Arc<M>,
    unload: bool,
    _permit: OwnedSemaphorePermit,
}

impl<M: ModelStage + ?Sized> Drop for ResidentSlot<M> {
    fn drop(&mut self) {
        if !self.unload {
            return;
        }
        match self.model.unload() {
            Ok(()) => debug!(model = %self.model.name(), "model unloaded"),
            Err(e) => warn!(model = %self.model.name(), error = %e, "model unload failed"),
        }
    }
}
