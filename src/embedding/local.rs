//! fastembed runtime.
//!
//! The model is downloaded (first run) and loaded lazily on the first
//! `embed` call, on a blocking thread. Inference also runs on a blocking
//! thread; the loaded model sits behind a mutex because fastembed needs
//! `&mut` access.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::info;

use super::EmbeddingRuntime;
use crate::config::EmbeddingConfig;

const DEFAULT_MODEL: &str = "all-minilm-l6-v2";

pub struct LocalRuntime {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: fastembed::EmbeddingModel,
    engine: OnceCell<Arc<Mutex<fastembed::TextEmbedding>>>,
}

impl LocalRuntime {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let (model, default_dims) = fastembed_model(&model_name)?;
        Ok(Self {
            dims: config.dims.unwrap_or(default_dims),
            batch_size: config.batch_size,
            model,
            model_name,
            engine: OnceCell::new(),
        })
    }

    async fn warm_up(&self) -> Result<Arc<Mutex<fastembed::TextEmbedding>>> {
        let engine = self
            .engine
            .get_or_try_init(|| async {
                let model = self.model.clone();
                let name = self.model_name.clone();
                let loaded = tokio::task::spawn_blocking(move || {
                    fastembed::TextEmbedding::try_new(
                        fastembed::InitOptions::new(model).with_show_download_progress(false),
                    )
                    .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))
                })
                .await??;
                info!(model = %name, "local embedding model ready");
                Ok::<_, anyhow::Error>(Arc::new(Mutex::new(loaded)))
            })
            .await?;
        Ok(engine.clone())
    }
}

fn fastembed_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
    match name {
        "all-minilm-l6-v2" => Ok((fastembed::EmbeddingModel::AllMiniLML6V2, 384)),
        "bge-small-en-v1.5" => Ok((fastembed::EmbeddingModel::BGESmallENV15, 384)),
        "bge-base-en-v1.5" => Ok((fastembed::EmbeddingModel::BGEBaseENV15, 768)),
        "nomic-embed-text-v1.5" => Ok((fastembed::EmbeddingModel::NomicEmbedTextV15, 768)),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, nomic-embed-text-v1.5",
            other
        ),
    }
}

#[async_trait]
impl EmbeddingRuntime for LocalRuntime {
    fn model_id(&self) -> &str {
        &self.model_name
    }

    fn version(&self) -> &str {
        "1"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let engine = self.warm_up().await?;
        let texts = texts.to_vec();
        let batch_size = self.batch_size;
        tokio::task::spawn_blocking(move || {
            let mut model = engine
                .lock()
                .map_err(|_| anyhow!("local embedding model lock poisoned"))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| anyhow!("Local embedding failed: {}", e))
        })
        .await?
    }
}
