use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use accelport_core::{
    Capabilities, ErrorStatus, ExecutionPreference, MetaModel, Model, Priority, Revision,
};
use accelport_memory::{BufferDesc, Memory, OperandInfo};
use anyhow::{bail, Context, Result};
use tokio::sync::{oneshot, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::cache::{open_cache_handles, MAX_CACHE_FILES};
use crate::{
    status_from_transport, CacheToken, Driver, DriverFactory, TransportError, TransportResult,
    VersionedPreparedModel,
};

/// The connection state swapped atomically during recovery. Readers see
/// either the old core or the fully probed new one, never a partial handle.
struct DeviceCore {
    driver: Arc<dyn Driver>,
    revision: Revision,
    capabilities: Capabilities,
    num_cache_files: (u32, u32),
}

/// Cheap per-call view of the current core.
#[derive(Clone)]
pub(crate) struct CoreSnapshot {
    pub driver: Arc<dyn Driver>,
    pub revision: Revision,
    pub num_cache_files: (u32, u32),
}

/// Determines the highest revision the driver answers, newest first. An
/// unsupported probe fails cleanly and moves on; a transport failure aborts.
async fn probe_core(driver: &Arc<dyn Driver>) -> Result<DeviceCore> {
    for revision in Revision::all_newest_first() {
        match driver.get_capabilities(revision).await {
            Ok((ErrorStatus::None, capabilities)) => {
                let num_cache_files = if revision >= Revision::V1_2 {
                    match driver.get_number_of_cache_files_needed().await {
                        Ok((ErrorStatus::None, model, data))
                            if model <= MAX_CACHE_FILES && data <= MAX_CACHE_FILES =>
                        {
                            (model, data)
                        }
                        _ => (0, 0),
                    }
                } else {
                    (0, 0)
                };
                return Ok(DeviceCore {
                    driver: driver.clone(),
                    revision,
                    capabilities,
                    num_cache_files,
                });
            }
            Ok((status, _)) => {
                debug!(%revision, ?status, "capability probe declined");
            }
            Err(TransportError::Unsupported) => {
                debug!(%revision, "revision not supported");
            }
            Err(err) => bail!("capability probe failed: {err}"),
        }
    }
    bail!("no interface revision responded")
}

/// One revision-independent device API over a backend driver whose interface
/// revision is discovered at connect time, with transparent reconnection
/// after a driver crash.
pub struct VersionedDevice {
    name: String,
    factory: Box<dyn DriverFactory>,
    core: RwLock<DeviceCore>,
    /// Set when recovery is exhausted; terminal for this instance.
    dead: AtomicBool,
}

impl VersionedDevice {
    pub async fn connect(
        name: impl Into<String>,
        factory: Box<dyn DriverFactory>,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let driver = factory
            .connect()
            .with_context(|| format!("driver factory for {name} returned no handle"))?;
        let core = probe_core(&driver)
            .await
            .with_context(|| format!("device {name} is not available"))?;
        info!(device = %name, revision = %core.revision, "connected to driver");
        Ok(Arc::new(Self {
            name,
            factory,
            core: RwLock::new(core),
            dead: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub async fn revision(&self) -> Revision {
        self.core.read().await.revision
    }

    /// Capabilities negotiated at connect time; immutable once queried.
    pub async fn capabilities(&self) -> Capabilities {
        self.core.read().await.capabilities.clone()
    }

    async fn snapshot(&self) -> CoreSnapshot {
        let core = self.core.read().await;
        CoreSnapshot {
            driver: core.driver.clone(),
            revision: core.revision,
            num_cache_files: core.num_cache_files,
        }
    }

    /// Wraps one abstract RPC invocation with the crash-recovery protocol:
    /// on a dead-object failure, ping once under the exclusive lock (another
    /// caller may have recovered already), reconnect through the factory if
    /// the driver is really gone, then replay the invocation exactly once.
    pub(crate) async fn recoverable<T, F, Fut>(&self, context: &str, f: F) -> TransportResult<T>
    where
        F: Fn(CoreSnapshot) -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        if self.is_dead() {
            return Err(TransportError::DeadObject);
        }
        let result = f(self.snapshot().await).await;
        if !matches!(result, Err(TransportError::DeadObject)) {
            return result;
        }

        {
            let mut core = self.core.write().await;
            match core.driver.ping().await {
                Err(TransportError::DeadObject) => {
                    warn!(device = %self.name, context, "driver died; attempting recovery");
                    let recovered = match self.factory.connect() {
                        Some(driver) => driver,
                        None => {
                            error!(device = %self.name, "driver factory returned no handle");
                            self.dead.store(true, Ordering::Release);
                            return result;
                        }
                    };
                    match probe_core(&recovered).await {
                        Ok(new_core) => {
                            info!(
                                device = %self.name,
                                revision = %new_core.revision,
                                "recovered driver connection"
                            );
                            *core = new_core;
                        }
                        Err(err) => {
                            error!(device = %self.name, error = %err, "recovery failed");
                            self.dead.store(true, Ordering::Release);
                            return result;
                        }
                    }
                }
                _ => {
                    debug!(device = %self.name, context, "driver already recovered elsewhere");
                }
            }
        }

        // Replay once; a second death is reported, not retried.
        f(self.snapshot().await).await
    }

    /// Blocking liveness check; runs the recovery path synchronously and
    /// returns once the driver answers or recovery is exhausted.
    pub async fn wait(&self) -> Result<()> {
        if self.is_dead() {
            bail!("device {} is dead", self.name);
        }
        let mut core = self.core.write().await;
        match core.driver.ping().await {
            Ok(()) => Ok(()),
            Err(TransportError::DeadObject) => {
                warn!(device = %self.name, "driver died; recovering in wait()");
                let recovered = match self.factory.connect() {
                    Some(driver) => driver,
                    None => {
                        self.dead.store(true, Ordering::Release);
                        bail!("device {} could not be recovered", self.name);
                    }
                };
                match probe_core(&recovered).await {
                    Ok(new_core) => {
                        *core = new_core;
                        Ok(())
                    }
                    Err(err) => {
                        self.dead.store(true, Ordering::Release);
                        Err(err.context(format!("device {} could not be recovered", self.name)))
                    }
                }
            }
            Err(err) => bail!("ping of device {} failed: {err}", self.name),
        }
    }

    /// Per-operation support for the model at the connected revision. When
    /// the model is not expressible at that revision, the driver is asked
    /// about the compliant slice and the answer is remapped to original
    /// operation indices; non-compliant operations are reported unsupported.
    pub async fn get_supported_operations(&self, meta: &MetaModel) -> (ErrorStatus, Vec<bool>) {
        let result = self
            .recoverable("get_supported_operations", |snap| async move {
                let model = meta.model();
                if model.compliant_with(snap.revision) {
                    return snap
                        .driver
                        .get_supported_operations(snap.revision, model)
                        .await;
                }
                match meta.slice(snap.revision) {
                    Some(slice) => {
                        let (status, supported) = snap
                            .driver
                            .get_supported_operations(snap.revision, &slice.model)
                            .await?;
                        Ok((status, meta.remap_supported(&slice, &supported)))
                    }
                    None => Ok((ErrorStatus::None, vec![false; model.operations.len()])),
                }
            })
            .await;
        match result {
            Ok(answer) => answer,
            Err(err) => {
                error!(device = %self.name, error = %err, "get_supported_operations failed");
                (status_from_transport(&err), Vec::new())
            }
        }
    }

    /// Prepares `model` on the driver, with compiled-artifact cache handles
    /// resolved from `token` when a cache directory is configured.
    pub async fn prepare_model(
        self: &Arc<Self>,
        model: &Model,
        preference: ExecutionPreference,
        priority: Priority,
        deadline: Option<Instant>,
        cache_dir: Option<&Path>,
        token: Option<CacheToken>,
    ) -> (ErrorStatus, Option<Arc<VersionedPreparedModel>>) {
        let result = self
            .recoverable("prepare_model", |snap| async move {
                if !model.compliant_with(snap.revision) {
                    // Downward conversion would lose required information.
                    warn!(
                        device = %self.name,
                        revision = %snap.revision,
                        "model is not expressible at the connected revision"
                    );
                    return Ok((
                        ErrorStatus::InvalidArgument,
                        None,
                        snap.revision,
                        snap.driver.death_watch(),
                    ));
                }
                let (model_cache, data_cache) = match (cache_dir, token.as_ref()) {
                    (Some(dir), Some(token)) => {
                        open_cache_handles(dir, token, snap.num_cache_files, true)
                            .unwrap_or_default()
                    }
                    _ => Default::default(),
                };
                let (tx, rx) = oneshot::channel();
                let launch = snap
                    .driver
                    .prepare_model(
                        snap.revision,
                        model,
                        preference,
                        priority,
                        deadline,
                        model_cache,
                        data_cache,
                        token,
                        tx,
                    )
                    .await?;
                if launch != ErrorStatus::None {
                    return Ok((launch, None, snap.revision, snap.driver.death_watch()));
                }
                let response = wait_or_death(snap.driver.death_watch(), rx).await?;
                Ok((
                    response.status,
                    response.prepared,
                    snap.revision,
                    snap.driver.death_watch(),
                ))
            })
            .await;
        self.finish_prepare(result, Some(model))
    }

    /// Prepares from the compiled-artifact cache alone. Any failure is
    /// surfaced so the caller can fall back to a full `prepare_model`.
    pub async fn prepare_model_from_cache(
        self: &Arc<Self>,
        deadline: Option<Instant>,
        cache_dir: &Path,
        token: CacheToken,
    ) -> (ErrorStatus, Option<Arc<VersionedPreparedModel>>) {
        let result = self
            .recoverable("prepare_model_from_cache", |snap| async move {
                if snap.revision < Revision::V1_2 {
                    return Ok((
                        ErrorStatus::GeneralFailure,
                        None,
                        snap.revision,
                        snap.driver.death_watch(),
                    ));
                }
                let handles =
                    open_cache_handles(cache_dir, &token, snap.num_cache_files, false);
                let (model_cache, data_cache) = match handles {
                    Some(handles) => handles,
                    None => {
                        debug!(device = %self.name, "no cache entry for token");
                        return Ok((
                            ErrorStatus::GeneralFailure,
                            None,
                            snap.revision,
                            snap.driver.death_watch(),
                        ));
                    }
                };
                let (tx, rx) = oneshot::channel();
                let launch = snap
                    .driver
                    .prepare_model_from_cache(deadline, model_cache, data_cache, token, tx)
                    .await?;
                if launch != ErrorStatus::None {
                    return Ok((launch, None, snap.revision, snap.driver.death_watch()));
                }
                let response = wait_or_death(snap.driver.death_watch(), rx).await?;
                Ok((
                    response.status,
                    response.prepared,
                    snap.revision,
                    snap.driver.death_watch(),
                ))
            })
            .await;
        self.finish_prepare(result, None)
    }

    fn finish_prepare(
        self: &Arc<Self>,
        result: TransportResult<(
            ErrorStatus,
            Option<Arc<dyn crate::DriverPreparedModel>>,
            Revision,
            watch::Receiver<bool>,
        )>,
        model: Option<&Model>,
    ) -> (ErrorStatus, Option<Arc<VersionedPreparedModel>>) {
        match result {
            Ok((status, Some(prepared), revision, death)) if status.is_ok() => {
                let versioned =
                    VersionedPreparedModel::new(prepared, self, revision, model, death);
                (ErrorStatus::None, Some(Arc::new(versioned)))
            }
            Ok((status, ..)) => {
                let status = if status.is_ok() {
                    // A driver that reports success must hand back a handle.
                    ErrorStatus::GeneralFailure
                } else {
                    status
                };
                (status, None)
            }
            Err(err) => {
                error!(device = %self.name, error = %err, "model preparation failed");
                (status_from_transport(&err), None)
            }
        }
    }

    /// Asks the driver for an in-device buffer allocation. Callers fall back
    /// to a generic shared allocation when this declines.
    pub async fn allocate_device_memory(
        &self,
        desc: &BufferDesc,
        input_roles: &[OperandInfo],
        output_roles: &[OperandInfo],
    ) -> (ErrorStatus, Option<Memory>) {
        let result = self
            .recoverable("allocate", |snap| async move {
                if snap.revision < Revision::V1_3 {
                    return Ok((ErrorStatus::GeneralFailure, None, 0));
                }
                snap.driver.allocate(desc, input_roles, output_roles).await
            })
            .await;
        match result {
            Ok((ErrorStatus::None, Some(memory), token)) if token > 0 => {
                (ErrorStatus::None, Some(memory))
            }
            Ok((status, _, _)) => {
                let status = if status.is_ok() {
                    ErrorStatus::GeneralFailure
                } else {
                    status
                };
                debug!(device = %self.name, ?status, "driver declined allocation");
                (status, None)
            }
            Err(err) => (status_from_transport(&err), None),
        }
    }
}

impl std::fmt::Debug for VersionedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedDevice")
            .field("name", &self.name)
            .field("dead", &self.is_dead())
            .finish_non_exhaustive()
    }
}

/// Selects over an asynchronous call's terminal response and the driver's
/// death watch, so a driver crash mid-call still delivers a terminal result.
pub(crate) async fn wait_or_death<T>(
    mut death: watch::Receiver<bool>,
    response: oneshot::Receiver<T>,
) -> TransportResult<T> {
    tokio::select! {
        res = response => res.map_err(|_| TransportError::DeadObject),
        _ = death.wait_for(|dead| *dead) => Err(TransportError::DeadObject),
    }
}
