use crate::config::Config;
use emotive_core::{
    Analysis, CascadeClassifier, DefaultPipeline, EmotionClassifier, EmotionPipeline,
    FaceAnalyzer, ModelInfo, PipelineError,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("cascade error: {0}")]
    Cascade(#[from] emotive_core::CascadeError),
    #[error("classifier error: {0}")]
    Classifier(#[from] emotive_core::ClassifierError),
    #[error("analysis failed: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Analyze {
        image: Vec<u8>,
        span: tracing::Span,
        reply: oneshot::Sender<Result<Analysis, PipelineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Decode `image`, find the first face and classify it.
    pub async fn analyze(&self, image: Vec<u8>) -> Result<Analysis, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Analyze {
                image,
                span: tracing::Span::current(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Load the cascade and the ONNX model named in `config`.
///
/// Fails fast: the daemon must not start serving without both.
pub fn load_pipeline(config: &Config) -> Result<(DefaultPipeline, ModelInfo), EngineError> {
    let detector = CascadeClassifier::load(&config.cascade_path)?.with_params(config.detection.clone())?;
    tracing::info!(
        path = %config.cascade_path.display(),
        window = ?detector.window_size(),
        stages = detector.stage_count(),
        "face cascade loaded"
    );

    let model = EmotionClassifier::load(&config.model_path, config.input_type)?;
    let info = model.info().clone();
    tracing::info!(path = %config.model_path.display(), "emotion model loaded");

    Ok((EmotionPipeline::new(detector, model), info))
}

/// Spawn the engine on a dedicated OS thread.
///
/// Requests are served one at a time in arrival order; the analyzer is
/// never shared between threads.
pub fn spawn_engine<A>(mut analyzer: A) -> Result<EngineHandle, EngineError>
where
    A: FaceAnalyzer + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("emotive-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Analyze { image, span, reply } => {
                        let _entered = span.enter();
                        let result = analyzer.analyze(&image);
                        if let Err(e) = &result {
                            tracing::debug!(error = %e, bytes = image.len(), "analysis failed");
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use emotive_core::{Emotion, EmotionPrediction, EmotionScores, FaceRect, ImageError};

    struct CountingAnalyzer {
        calls: usize,
    }

    impl FaceAnalyzer for CountingAnalyzer {
        fn analyze(&mut self, image: &[u8]) -> Result<Analysis, PipelineError> {
            self.calls += 1;
            if image.is_empty() {
                return Err(ImageError::Empty.into());
            }
            if self.calls % 2 == 0 {
                return Ok(Analysis::NoFace);
            }
            let mut raw = [0.0; 7];
            raw[Emotion::Sad.index()] = 1.0;
            let scores = EmotionScores(raw);
            Ok(Analysis::Face {
                prediction: EmotionPrediction::from_scores(&scores, FaceRect::new(1, 2, 3, 4)),
                scores,
            })
        }
    }

    #[tokio::test]
    async fn test_requests_are_serialized_through_one_analyzer() {
        let handle = spawn_engine(CountingAnalyzer { calls: 0 }).unwrap();

        let first = handle.analyze(vec![1]).await.unwrap();
        let Analysis::Face { prediction, .. } = first else {
            panic!("expected a face");
        };
        assert_eq!(prediction.emotion, Emotion::Sad);
        assert_eq!(prediction.face, FaceRect::new(1, 2, 3, 4));

        // Second call on the same analyzer state.
        assert_eq!(handle.clone().analyze(vec![1]).await.unwrap(), Analysis::NoFace);
    }

    #[tokio::test]
    async fn test_pipeline_errors_propagate() {
        let handle = spawn_engine(CountingAnalyzer { calls: 0 }).unwrap();
        let err = handle.analyze(Vec::new()).await.unwrap_err();
        match err {
            EngineError::Pipeline(e) => assert!(e.is_invalid_input()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_pipeline_missing_cascade() {
        let config = Config {
            cascade_path: "/nonexistent/cascade.xml".into(),
            ..Config::default()
        };
        assert!(matches!(load_pipeline(&config), Err(EngineError::Cascade(_))));
    }
}
