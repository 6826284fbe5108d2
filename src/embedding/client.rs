//! Batching, bounded-concurrency, retrying wrapper around an [`Embedder`].
//!
//! # Retry strategy
//!
//! - Every provider call runs under its own timeout; an elapsed timeout
//!   counts as a transient failure.
//! - Transient failures are retried after `base * 2^(attempt-1)`, capped at
//!   `max_delay`, up to `max_retries` times. Exhaustion yields
//!   `EmbeddingUnavailable`.
//! - Permanent failures yield `EmbeddingRejected` immediately.
//! - A response with the wrong number of vectors, or vectors of the wrong
//!   length, is `EmbeddingRejected`. Nothing partial is returned.

use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use tracing::{debug, warn};

use rag_harness_core::embedding::{EmbedError, Embedder};
use rag_harness_core::{RagError, Result};

use super::backoff_delay;
use crate::config::EmbeddingConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        RetryPolicy {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_ms),
            max_delay: Duration::from_millis(config.retry_max_ms),
            call_timeout: config.call_timeout(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EmbeddingConfig::default())
    }
}

#[derive(Clone)]
pub struct EmbeddingClient {
    embedder: Arc<dyn Embedder>,
    policy: RetryPolicy,
    batch_size: usize,
    max_concurrency: usize,
}

impl EmbeddingClient {
    pub fn new(embedder: Arc<dyn Embedder>, config: &EmbeddingConfig) -> Self {
        Self {
            embedder,
            policy: RetryPolicy::from_config(config),
            batch_size: config.batch_size.max(1),
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn model(&self) -> &str {
        self.embedder.model()
    }

    pub fn dims(&self) -> usize {
        self.embedder.dims()
    }

    /// Embed every text, one vector per input, in input order.
    ///
    /// Batches run concurrently up to `max_concurrency`. The first failing
    /// batch aborts the rest.
    pub async fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let owned: Vec<Vec<String>> = texts
            .chunks(self.batch_size)
            .map(<[String]>::to_vec)
            .collect();
        let batches: Vec<Vec<Vec<f32>>> = futures::stream::iter(owned)
            .enumerate()
            .map(|(i, batch)| async move { self.embed_batch(i, &batch).await })
            .buffered(self.max_concurrency)
            .try_collect()
            .await?;

        Ok(batches.into_iter().flatten().collect())
    }

    /// Embed a single query text as a one-item batch.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_all(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::EmbeddingRejected("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, index: usize, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut attempt: u32 = 0;
        loop {
            let outcome =
                match tokio::time::timeout(self.policy.call_timeout, self.embedder.embed(batch))
                    .await
                {
                    Ok(r) => r,
                    Err(_) => Err(EmbedError::Transient(format!(
                        "embedding call timed out after {:?}",
                        self.policy.call_timeout
                    ))),
                };

            match outcome {
                Ok(vectors) => {
                    debug!(batch = index, size = batch.len(), attempt, "embedded batch");
                    return self.validate(batch.len(), vectors);
                }
                Err(EmbedError::Permanent(message)) => {
                    return Err(RagError::EmbeddingRejected(message));
                }
                Err(EmbedError::Transient(message)) => {
                    if attempt >= self.policy.max_retries {
                        return Err(RagError::EmbeddingUnavailable {
                            attempts: attempt + 1,
                            message,
                        });
                    }
                    attempt += 1;
                    let delay =
                        backoff_delay(self.policy.base_delay, self.policy.max_delay, attempt);
                    warn!(
                        batch = index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "transient embedding failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn validate(&self, expected: usize, vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        if vectors.len() != expected {
            return Err(RagError::EmbeddingRejected(format!(
                "provider returned {} vectors for {} inputs",
                vectors.len(),
                expected
            )));
        }
        let dims = self.embedder.dims();
        for v in &vectors {
            if v.is_empty() || (dims > 0 && v.len() != dims) {
                return Err(RagError::EmbeddingRejected(format!(
                    "provider returned a {}-dimensional vector, expected {}",
                    v.len(),
                    dims
                )));
            }
            if v.iter().any(|x| !x.is_finite()) {
                return Err(RagError::EmbeddingRejected(
                    "provider returned a non-finite vector component".to_string(),
                ));
            }
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays a script of outcomes, then answers with constant vectors.
    struct Scripted {
        dims: usize,
        script: Mutex<Vec<EmbedError>>,
        calls: AtomicUsize,
        batch_sizes: Mutex<Vec<usize>>,
    }

    impl Scripted {
        fn new(dims: usize, failures: Vec<EmbedError>) -> Self {
            Scripted {
                dims,
                script: Mutex::new(failures),
                calls: AtomicUsize::new(0),
                batch_sizes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Embedder for Scripted {
        fn model(&self) -> &str {
            "scripted"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batch_sizes.lock().unwrap().push(texts.len());
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() {
                    None
                } else {
                    Some(script.remove(0))
                }
            };
            match next {
                Some(err) => Err(err),
                None => Ok(texts
                    .iter()
                    .map(|t| vec![t.len() as f32; self.dims])
                    .collect()),
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl Embedder for Slow {
        fn model(&self) -> &str {
            "slow"
        }
        fn dims(&self) -> usize {
            1
        }
        async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbedError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![vec![1.0]; texts.len()])
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            call_timeout: Duration::from_secs(5),
        }
    }

    fn client(embedder: Arc<dyn Embedder>, batch_size: usize, retries: u32) -> EmbeddingClient {
        let config = EmbeddingConfig {
            batch_size,
            max_concurrency: 3,
            ..Default::default()
        };
        EmbeddingClient::new(embedder, &config).with_policy(fast_policy(retries))
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| "x".repeat(i + 1)).collect()
    }

    #[tokio::test]
    async fn test_batches_preserve_order() {
        let fake = Arc::new(Scripted::new(2, Vec::new()));
        let c = client(fake.clone(), 4, 0);

        let vectors = c.embed_all(&texts(10)).await.unwrap();
        assert_eq!(vectors.len(), 10);
        for (i, v) in vectors.iter().enumerate() {
            assert_eq!(v, &vec![(i + 1) as f32; 2]);
        }
        let mut sizes = fake.batch_sizes.lock().unwrap().clone();
        sizes.sort();
        assert_eq!(sizes, vec![2, 4, 4]);
    }

    #[tokio::test]
    async fn test_embed_all_runs_on_spawned_task() {
        let fake = Arc::new(Scripted::new(2, Vec::new()));
        let c = Arc::new(client(fake, 3, 0));

        let handle = tokio::spawn(async move {
            let batch = texts(7);
            c.embed_all(&batch).await
        });
        let vectors = handle.await.unwrap().unwrap();
        assert_eq!(vectors.len(), 7);
        assert_eq!(vectors[6], vec![7.0; 2]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let fake = Arc::new(Scripted::new(
            2,
            vec![
                EmbedError::Transient("429 Too Many Requests".into()),
                EmbedError::Transient("429 Too Many Requests".into()),
            ],
        ));
        let c = client(fake.clone(), 10, 3);

        let vectors = c.embed_all(&texts(3)).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let fake = Arc::new(Scripted::new(
            2,
            vec![EmbedError::Transient("503".into()); 5],
        ));
        let c = client(fake.clone(), 10, 2);

        let err = c.embed_all(&texts(1)).await.unwrap_err();
        match err {
            RagError::EmbeddingUnavailable { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fake.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let fake = Arc::new(Scripted::new(2, vec![EmbedError::Permanent("401".into())]));
        let c = client(fake.clone(), 10, 5);

        let err = c.embed_all(&texts(1)).await.unwrap_err();
        assert_eq!(err.kind(), "EmbeddingRejected");
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        struct Wrong;
        #[async_trait]
        impl Embedder for Wrong {
            fn model(&self) -> &str {
                "wrong"
            }
            fn dims(&self) -> usize {
                3
            }
            async fn embed(
                &self,
                texts: &[String],
            ) -> std::result::Result<Vec<Vec<f32>>, EmbedError> {
                Ok(vec![vec![1.0, 2.0]; texts.len()])
            }
        }

        let err = client(Arc::new(Wrong), 10, 0)
            .embed_all(&texts(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "EmbeddingRejected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_is_transient() {
        let c = client(Arc::new(Slow), 10, 1).with_policy(RetryPolicy {
            call_timeout: Duration::from_millis(100),
            ..fast_policy(1)
        });
        let err = c.embed_query("hello").await.unwrap_err();
        match err {
            RagError::EmbeddingUnavailable { attempts, message } => {
                assert_eq!(attempts, 2);
                assert!(message.contains("timed out"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_calls() {
        let fake = Arc::new(Scripted::new(2, Vec::new()));
        let c = client(fake.clone(), 10, 0);
        assert!(c.embed_all(&[]).await.unwrap().is_empty());
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }
}
