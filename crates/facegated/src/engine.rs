use facegate_core::{
    Embedding, EnrollError, EnrollmentBuilder, EnrollmentCaptures, Task, VerificationOrchestrator,
    VerificationOutcome, VerifyError,
};
use image::RgbImage;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine workers exited")]
    ChannelClosed,
    #[error("failed to spawn engine worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Enrollment and verification, shared by every worker.
pub struct Pipeline {
    pub enrollment: EnrollmentBuilder,
    pub verification: VerificationOrchestrator,
}

/// Messages sent from HTTP handlers to the engine workers.
enum EngineRequest {
    Enroll {
        front: RgbImage,
        left: RgbImage,
        right: RgbImage,
        reply: oneshot::Sender<Result<Embedding, EngineError>>,
    },
    Verify {
        identity: String,
        capture: String,
        task: Task,
        reply: oneshot::Sender<Result<VerificationOutcome, EngineError>>,
    },
}

/// Clone-safe handle to the engine workers.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Build the reference embedding from three decoded captures.
    pub async fn enroll(&self, front: RgbImage, left: RgbImage, right: RgbImage) -> Result<Embedding, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.call(EngineRequest::Enroll { front, left, right, reply }, rx).await
    }

    /// Verify an encoded capture against the stored reference of `identity`.
    pub async fn verify(&self, identity: &str, capture: String, task: Task) -> Result<VerificationOutcome, EngineError> {
        let (reply, rx) = oneshot::channel();
        let request = EngineRequest::Verify {
            identity: identity.to_string(),
            capture,
            task,
            reply,
        };
        self.call(request, rx).await
    }

    /// Queue `request` and wait for its reply, bounded by the engine timeout.
    async fn call<T>(
        &self,
        request: EngineRequest,
        reply: oneshot::Receiver<Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        let exchange = async {
            self.tx
                .send(request)
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            reply.await.map_err(|_| EngineError::ChannelClosed)?
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))?
    }
}

/// Spawn `workers` OS threads that share one bounded request queue.
///
/// A request that times out is still run to completion by its worker; only
/// the reply is dropped.
pub fn spawn_engine(
    pipeline: Pipeline,
    workers: usize,
    queue: usize,
    timeout: Duration,
) -> Result<EngineHandle, EngineError> {
    let (tx, rx) = mpsc::channel::<EngineRequest>(queue.max(1));
    let rx = Arc::new(Mutex::new(rx));
    let pipeline = Arc::new(pipeline);

    for index in 0..workers.max(1) {
        let rx = Arc::clone(&rx);
        let pipeline = Arc::clone(&pipeline);
        std::thread::Builder::new()
            .name(format!("facegate-engine-{index}"))
            .spawn(move || {
                tracing::info!(worker = index, "engine worker started");
                loop {
                    let request = match rx.lock() {
                        Ok(mut rx) => rx.blocking_recv(),
                        Err(_) => None,
                    };
                    let Some(request) = request else { break };
                    handle(&pipeline, request);
                }
                tracing::info!(worker = index, "engine worker exiting");
            })
            .map_err(EngineError::Spawn)?;
    }

    tracing::info!(workers, queue, timeout_secs = timeout.as_secs_f32(), "engine ready");
    Ok(EngineHandle { tx, timeout })
}

fn handle(pipeline: &Pipeline, request: EngineRequest) {
    match request {
        EngineRequest::Enroll { front, left, right, reply } => {
            let captures = EnrollmentCaptures { front: &front, left: &left, right: &right };
            let result = pipeline.enrollment.build(&captures).map_err(EngineError::from);
            let _ = reply.send(result);
        }
        EngineRequest::Verify { identity, capture, task, reply } => {
            let result = pipeline
                .verification
                .verify(&identity, &capture, task)
                .map_err(EngineError::from);
            let _ = reply.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{data_uri, fake_pipeline, solid, MemoryReferences, PixelEmbedder, SlowEmbedder};
    use facegate_core::FaceMatch;

    #[tokio::test]
    async fn test_enroll_then_verify() {
        let references = Arc::new(MemoryReferences::default());
        let engine = spawn_engine(
            fake_pipeline(Arc::new(PixelEmbedder), references.clone()),
            2,
            4,
            Duration::from_secs(5),
        )
        .unwrap();

        let reference = engine
            .enroll(solid([1, 1, 1]), solid([40, 20, 10]), solid([40, 20, 10]))
            .await
            .unwrap();
        references.insert("ada@example.com", reference);

        let outcome = engine
            .verify("ada@example.com", data_uri(&solid([40, 20, 10])), Task::Front)
            .await
            .unwrap();
        assert_eq!(outcome.face_match, FaceMatch::Matched);
    }

    #[tokio::test]
    async fn test_enroll_error_passes_through() {
        let engine = spawn_engine(
            fake_pipeline(Arc::new(PixelEmbedder), Arc::new(MemoryReferences::default())),
            1,
            1,
            Duration::from_secs(5),
        )
        .unwrap();

        let err = engine
            .enroll(solid([1, 1, 1]), solid([0, 0, 0]), solid([5, 5, 5]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Enroll(EnrollError::NoFaceDetected { image: 2 })));
    }

    #[tokio::test]
    async fn test_slow_inference_times_out() {
        let engine = spawn_engine(
            fake_pipeline(Arc::new(SlowEmbedder(Duration::from_millis(500))), Arc::new(MemoryReferences::default())),
            1,
            1,
            Duration::from_millis(50),
        )
        .unwrap();

        let err = engine
            .enroll(solid([1, 1, 1]), solid([2, 2, 2]), solid([3, 3, 3]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }
}
