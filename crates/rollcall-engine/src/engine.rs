use crate::config::Config;
use crate::identity::{Identity, IdentityError, IdentityStore};
use crate::registry::{IdentityRegistry, UNKNOWN_NAME};
use crate::store::{SampleRef, SampleStore, StoreError};
use image::DynamicImage;
use rollcall_core::input::crop;
use rollcall_core::{
    detect_faces, Detection, FaceDetector, IdentityId, ImageError, ImageInput, LbphModel,
    MatchPolicy, ModelState, RecognizerError,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid image: {0}")]
    InvalidImage(#[from] ImageError),
    #[error("No face detected in the image")]
    NoFaceDetected,
    #[error("Multiple faces detected. Please upload image with only one face.")]
    MultipleFacesDetected { count: usize },
    #[error("model not trained")]
    ModelNotTrained,
    #[error("sample store error: {0}")]
    Persistence(#[from] StoreError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("Identity not found")]
    IdentityNotFound(IdentityId),
    #[error("identity store error: {0}")]
    Identity(#[from] IdentityError),
    #[error("worker did not answer within {0:?}")]
    Timeout(Duration),
    #[error("worker failed: {0}")]
    WorkerFailed(String),
    #[error("service is shut down")]
    ShutDown,
}

impl EngineError {
    /// Errors caused by the caller's input; their message is shown verbatim.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidImage(_)
                | EngineError::NoFaceDetected
                | EngineError::MultipleFacesDetected { .. }
                | EngineError::IdentityNotFound(_)
        )
    }
}

/// Caller-facing result of an enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollOutcome {
    pub ok: bool,
    pub message: String,
}

pub const ENROLL_SUCCESS: &str = "Face registered successfully!";

impl EnrollOutcome {
    fn from_result(identity: IdentityId, result: Result<SampleRef, EngineError>) -> Self {
        match result {
            Ok(_) => Self {
                ok: true,
                message: ENROLL_SUCCESS.to_string(),
            },
            Err(e) if e.is_user_facing() => {
                tracing::info!(identity = %identity, reason = %e, "enrollment rejected");
                Self {
                    ok: false,
                    message: e.to_string(),
                }
            }
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "enrollment failed");
                Self {
                    ok: false,
                    message: format!("Error registering face: {e}"),
                }
            }
        }
    }
}

/// Snapshot of the service for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub trained: bool,
    pub model_samples: usize,
    pub model_identities: usize,
    pub stored_samples: usize,
    pub registered_identities: usize,
}

/// Owns the detector, sample store, recognition model and identity registry.
///
/// Enrollment and retraining serialize on the sample store lock; the model
/// is replaced wholesale under a short write lock, so recognition always
/// works on a complete snapshot.
pub struct FaceRecognitionService {
    config: Config,
    policy: MatchPolicy,
    detector: Arc<dyn FaceDetector>,
    store: Mutex<SampleStore>,
    model: RwLock<ModelState>,
    registry: RwLock<IdentityRegistry>,
    identities: Option<Arc<dyn IdentityStore>>,
    shut_down: AtomicBool,
}

impl FaceRecognitionService {
    /// Build an unloaded service. Nothing is read from disk until [`load`](Self::load).
    pub fn new(config: Config, detector: Arc<dyn FaceDetector>) -> Self {
        Self {
            policy: config.match_policy(),
            store: Mutex::new(SampleStore::new(config.data_dir.clone())),
            config,
            detector,
            model: RwLock::new(ModelState::NotTrained),
            registry: RwLock::new(IdentityRegistry::new()),
            identities: None,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Attach the external identity store used for existence checks,
    /// registration flags and display names.
    pub fn with_identity_store(mut self, identities: Arc<dyn IdentityStore>) -> Self {
        self.identities = Some(identities);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn lock_store(&self) -> MutexGuard<'_, SampleStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_model(&self) -> RwLockReadGuard<'_, ModelState> {
        self.model.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_model(&self) -> RwLockWriteGuard<'_, ModelState> {
        self.model.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_registry(&self) -> RwLockReadGuard<'_, IdentityRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, IdentityRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(EngineError::ShutDown);
        }
        Ok(())
    }

    /// Startup hook: read the sample index, restore the model artifact and
    /// rebuild the registry. Safe to call repeatedly; failures are logged
    /// and leave the service untrained.
    pub fn load(&self) {
        let mut store = self.lock_store();
        if let Err(e) = store.reload() {
            tracing::warn!(dir = %self.config.data_dir.display(), error = %e, "sample store unavailable");
        }

        let mut state = match LbphModel::load(&self.config.model_path) {
            Ok(model) => {
                if model.params() != &self.config.recognizer {
                    tracing::warn!(
                        artifact = ?model.params(),
                        configured = ?self.config.recognizer,
                        "model artifact uses different LBPH parameters; keeping it until the next retrain"
                    );
                }
                ModelState::Trained(Arc::new(model))
            }
            Err(RecognizerError::ArtifactNotFound(path)) => {
                tracing::info!(path = %path, "no model artifact; starting untrained");
                ModelState::NotTrained
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.config.model_path.display(),
                    error = %e,
                    "model artifact unusable; starting untrained"
                );
                ModelState::NotTrained
            }
        };

        if !state.is_trained() && self.config.retrain_on_load && !store.is_empty() {
            match self.train_and_persist(&store) {
                Ok(trained) => state = trained,
                Err(e) => tracing::warn!(error = %e, "retrain on load failed"),
            }
        }

        let trained = state.is_trained();
        *self.write_model() = state;
        drop(store);

        self.reload_registry();
        tracing::info!(
            trained,
            samples = self.lock_store().len(),
            identities = self.read_registry().len(),
            "face recognition service loaded"
        );
    }

    fn reload_registry(&self) {
        let Some(identities) = &self.identities else {
            return;
        };
        let mut registry = self.write_registry();
        if let Err(e) = registry.reload(identities.as_ref()) {
            tracing::warn!(error = %e, "identity registry reload failed; keeping cached names");
        }
    }

    /// Train a fresh model over every stored sample, persist it and swap it in.
    ///
    /// Callers hold the store lock, which makes this the only writer.
    fn train_and_persist(&self, store: &SampleStore) -> Result<ModelState, EngineError> {
        let state = LbphModel::train(self.config.recognizer, store.all())?;

        match state.model() {
            Some(model) => {
                if let Err(e) = model.save(&self.config.model_path) {
                    tracing::warn!(
                        path = %self.config.model_path.display(),
                        error = %e,
                        "model artifact not persisted; serving the in-memory model"
                    );
                }
            }
            None if self.config.model_path.exists() => {
                // A stale artifact would resurrect the old model on the next load.
                if let Err(e) = std::fs::remove_file(&self.config.model_path) {
                    tracing::warn!(path = %self.config.model_path.display(), error = %e, "failed to remove stale model artifact");
                }
            }
            None => {}
        }

        *self.write_model() = state.clone();
        Ok(state)
    }

    /// Enroll one face sample for `identity`.
    ///
    /// The image must contain exactly one face. A stored sample is kept even
    /// if the retrain that follows fails.
    pub fn try_enroll(
        &self,
        input: ImageInput,
        identity: IdentityId,
        display_name: &str,
    ) -> Result<SampleRef, EngineError> {
        self.ensure_running()?;

        if let Some(identities) = &self.identities {
            if identities.lookup(identity)?.is_none() {
                return Err(EngineError::IdentityNotFound(identity));
            }
        }

        let image = input.decode()?;
        let (faces, gray) = detect_faces(self.detector.as_ref(), &image);
        let bbox = match faces.as_slice() {
            [] => return Err(EngineError::NoFaceDetected),
            [bbox] => *bbox,
            many => return Err(EngineError::MultipleFacesDetected { count: many.len() }),
        };
        let region = crop(&gray, &bbox)?;

        let mut store = self.lock_store();
        let sample = store.add(identity, &region)?;

        if let Some(identities) = &self.identities {
            if let Err(e) = identities.mark_registered(identity) {
                tracing::warn!(identity = %identity, error = %e, "failed to set face_registered");
            }
        }
        self.write_registry().upsert(identity, display_name);

        match self.train_and_persist(&store) {
            Ok(state) => tracing::info!(
                identity = %identity,
                samples = store.len(),
                trained = state.is_trained(),
                "enrollment complete"
            ),
            Err(e) => tracing::warn!(
                identity = %identity,
                error = %e,
                "sample stored but retrain failed; the next enrollment will retry"
            ),
        }
        drop(store);

        Ok(sample)
    }

    /// [`try_enroll`](Self::try_enroll) folded into the caller-facing `(ok, message)` shape.
    pub fn enroll(&self, input: ImageInput, identity: IdentityId, display_name: &str) -> EnrollOutcome {
        EnrollOutcome::from_result(identity, self.try_enroll(input, identity, display_name))
    }

    /// Locate and identify every face in `image`.
    ///
    /// An untrained model yields no detections. Unknown faces are kept with
    /// a null identity and confidence 0.
    pub fn recognize(&self, image: &DynamicImage) -> Vec<Detection> {
        let model = self.read_model().clone();
        if !model.is_trained() {
            tracing::debug!("recognition skipped: model not trained");
            return Vec::new();
        }

        let (faces, gray) = detect_faces(self.detector.as_ref(), image);
        let registry = self.read_registry();

        faces
            .into_iter()
            .map(|bbox| {
                let prediction = crop(&gray, &bbox)
                    .map_err(EngineError::from)
                    .and_then(|region| model.predict(&region).map_err(EngineError::from));

                let (identity_id, confidence) = match prediction {
                    Ok(p) => {
                        tracing::debug!(identity = %p.identity_id, distance = p.distance, "face predicted");
                        self.policy.gate(&p)
                    }
                    Err(e) => {
                        tracing::debug!(?bbox, error = %e, "face left unidentified");
                        (None, 0.0)
                    }
                };
                let display_name = match identity_id {
                    Some(id) => registry.resolve(id),
                    None => UNKNOWN_NAME,
                };

                Detection {
                    identity_id,
                    bbox,
                    confidence,
                    display_name: display_name.to_string(),
                }
            })
            .collect()
    }

    /// Decode `input` and run [`recognize`](Self::recognize).
    pub fn recognize_input(&self, input: ImageInput) -> Result<Vec<Detection>, EngineError> {
        self.ensure_running()?;
        let image = input.decode()?;
        Ok(self.recognize(&image))
    }

    /// Rebuild the model from the whole sample store.
    pub fn retrain(&self) -> Result<ServiceStatus, EngineError> {
        self.ensure_running()?;
        {
            let mut store = self.lock_store();
            store.reload()?;
            self.train_and_persist(&store)?;
        }
        self.reload_registry();
        Ok(self.status())
    }

    /// Identity record from the external store, or from the registry cache
    /// when no store is attached.
    pub fn lookup_identity(&self, identity: IdentityId) -> Result<Option<Identity>, EngineError> {
        if let Some(identities) = &self.identities {
            return Ok(identities.lookup(identity)?);
        }
        let registry = self.read_registry();
        Ok(registry.contains(identity).then(|| Identity {
            id: identity,
            name: registry.resolve(identity).to_string(),
            face_registered: true,
        }))
    }

    pub fn is_trained(&self) -> bool {
        self.read_model().is_trained()
    }

    pub fn registry(&self) -> IdentityRegistry {
        self.read_registry().clone()
    }

    pub fn status(&self) -> ServiceStatus {
        let model = self.read_model().clone();
        ServiceStatus {
            trained: model.is_trained(),
            model_samples: model.model().map_or(0, |m| m.sample_count()),
            model_identities: model.model().map_or(0, |m| m.identities().len()),
            stored_samples: self.lock_store().len(),
            registered_identities: self.read_registry().len(),
        }
    }

    /// Refuse further enrollments and retrains. In-flight work completes.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            tracing::info!("face recognition service shutting down");
        }
    }
}

/// Requests handled by the engine thread, the single writer.
enum EngineRequest {
    Enroll {
        input: ImageInput,
        identity: IdentityId,
        display_name: String,
        reply: oneshot::Sender<Result<SampleRef, EngineError>>,
    },
    Retrain {
        reply: oneshot::Sender<Result<ServiceStatus, EngineError>>,
    },
}

/// Clone-safe async handle to a [`FaceRecognitionService`].
///
/// Enrollment and retraining are queued to a dedicated engine thread;
/// recognition and lookups run on the blocking pool so they can overlap.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    service: Arc<FaceRecognitionService>,
    timeout: Duration,
}

impl EngineHandle {
    /// Spawn the engine thread for `service`. The thread exits once every
    /// handle has been dropped.
    pub fn spawn(service: Arc<FaceRecognitionService>) -> Result<Self, EngineError> {
        let timeout = Duration::from_secs(service.config().worker_timeout_secs.max(1));
        let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

        let worker = Arc::clone(&service);
        std::thread::Builder::new()
            .name("rollcall-engine".into())
            .spawn(move || {
                tracing::info!("engine thread started");
                while let Some(req) = rx.blocking_recv() {
                    match req {
                        EngineRequest::Enroll {
                            input,
                            identity,
                            display_name,
                            reply,
                        } => {
                            let result = worker.try_enroll(input, identity, &display_name);
                            let _ = reply.send(result);
                        }
                        EngineRequest::Retrain { reply } => {
                            let _ = reply.send(worker.retrain());
                        }
                    }
                }
                tracing::info!("engine thread exiting");
            })
            .map_err(|e| EngineError::WorkerFailed(format!("failed to spawn engine thread: {e}")))?;

        Ok(Self {
            tx,
            service,
            timeout,
        })
    }

    pub fn service(&self) -> &Arc<FaceRecognitionService> {
        &self.service
    }

    /// Queue a request for the engine thread and wait for its reply. The
    /// deadline covers waiting for queue space as well as the reply.
    async fn submit<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let closed = || EngineError::WorkerFailed("engine thread exited".into());
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async {
            if self.tx.send(request(reply_tx)).await.is_err() {
                return Err(closed());
            }
            match reply_rx.await {
                Ok(result) => result,
                Err(_) => Err(closed()),
            }
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .unwrap_or_else(|_| Err(EngineError::Timeout(self.timeout)))
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&FaceRecognitionService) -> Result<T, EngineError> + Send + 'static,
    {
        let service = Arc::clone(&self.service);
        let task = tokio::task::spawn_blocking(move || f(&service));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(EngineError::WorkerFailed(e.to_string())),
            Err(_) => Err(EngineError::Timeout(self.timeout)),
        }
    }

    pub async fn try_enroll(
        &self,
        input: ImageInput,
        identity: IdentityId,
        display_name: impl Into<String>,
    ) -> Result<SampleRef, EngineError> {
        let display_name = display_name.into();
        self.submit(|reply| EngineRequest::Enroll {
            input,
            identity,
            display_name,
            reply,
        })
        .await
    }

    /// Enroll and report `(ok, message)`. A timeout only stops the wait;
    /// the queued enrollment still runs.
    pub async fn enroll(
        &self,
        input: ImageInput,
        identity: IdentityId,
        display_name: impl Into<String>,
    ) -> EnrollOutcome {
        EnrollOutcome::from_result(identity, self.try_enroll(input, identity, display_name).await)
    }

    pub async fn retrain(&self) -> Result<ServiceStatus, EngineError> {
        self.submit(|reply| EngineRequest::Retrain { reply }).await
    }

    pub async fn recognize(&self, input: ImageInput) -> Result<Vec<Detection>, EngineError> {
        self.run_blocking(move |service| service.recognize_input(input)).await
    }

    pub async fn lookup_identity(&self, identity: IdentityId) -> Result<Option<Identity>, EngineError> {
        self.run_blocking(move |service| service.lookup_identity(identity)).await
    }

    pub async fn status(&self) -> Result<ServiceStatus, EngineError> {
        self.run_blocking(|service| Ok(service.status())).await
    }

    pub fn shutdown(&self) {
        self.service.shutdown();
    }
}
