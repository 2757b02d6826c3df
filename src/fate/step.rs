//! The step contract and the registry that rebuilds persisted stacks.
//!
//! A [`Step`] is one unit of forward work plus its compensating undo. Steps
//! are persisted as [`StoredStep`] envelopes keyed by a stable type tag, and
//! the [`StepRegistry`] maps each tag back to a decoder. Tags are never
//! reused; a renamed step keeps decoding historical stacks through an alias.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use super::id::FateId;
use super::lock::LockRequest;
use crate::error::{FateError, Result};

pub type BoxStep<E> = Box<dyn Step<E>>;

/// Outcome of a forward call: `Some` pushes a follow-up step, `None`
/// completes the operation.
pub type StepOutcome<E> = anyhow::Result<Option<BoxStep<E>>>;

/// One unit of work in an operation.
///
/// The engine may invoke `call` or `undo` more than once for the same step
/// when a worker dies mid-step, so both must be idempotent.
#[async_trait]
pub trait Step<E>: Send + Sync {
    /// Stable type tag used to find the decoder for a persisted step.
    fn name(&self) -> &'static str;

    /// Schema version of the persisted payload, handed back to the decoder.
    fn version(&self) -> u32 {
        1
    }

    fn to_json(&self) -> serde_json::Result<Value>;

    /// Resources this step needs before the operation may run. Only the
    /// locks of the seeded step are requested; they are held until the
    /// operation reaches a terminal status.
    fn locks(&self) -> Vec<LockRequest> {
        Vec::new()
    }

    /// When true, `undo` is also run for this step if its own `call` failed.
    fn undo_after_failure(&self) -> bool {
        false
    }

    /// Zero when the step can run now, otherwise how long to wait.
    async fn is_ready(&self, _id: FateId, _ctx: &StepContext<E>) -> anyhow::Result<Duration> {
        Ok(Duration::ZERO)
    }

    async fn call(&self, id: FateId, ctx: &StepContext<E>) -> StepOutcome<E>;

    async fn undo(&self, id: FateId, ctx: &StepContext<E>) -> anyhow::Result<()>;
}

impl<E> fmt::Debug for dyn Step<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("name", &self.name()).finish()
    }
}

/// Handed to every step invocation in place of global state.
pub struct StepContext<E> {
    env: Arc<E>,
    span: tracing::Span,
    shutdown: watch::Receiver<bool>,
}

impl<E> StepContext<E> {
    pub fn new(env: Arc<E>, span: tracing::Span, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            env,
            span,
            shutdown,
        }
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    /// Span the step runs in; carries `fate_id` and `step` fields.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// True once the executor has been asked to stop. Long steps should
    /// return early and let the operation resume on the next start.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves when shutdown is requested.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown.clone();
        // A dropped sender also means the executor is gone.
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

/// Persisted form of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredStep {
    pub name: String,
    pub version: u32,
    pub data: Value,
}

type Decoder<E> = Box<dyn Fn(u32, Value) -> Result<BoxStep<E>> + Send + Sync>;

/// Maps type tags to decoders.
pub struct StepRegistry<E> {
    decoders: HashMap<String, Decoder<E>>,
    aliases: HashMap<String, String>,
}

impl<E> Default for StepRegistry<E> {
    fn default() -> Self {
        Self {
            decoders: HashMap::new(),
            aliases: HashMap::new(),
        }
    }
}

impl<E: 'static> StepRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a decoder. Registering the same tag twice replaces the
    /// earlier decoder.
    pub fn register<F>(&mut self, name: &str, decoder: F) -> &mut Self
    where
        F: Fn(u32, Value) -> Result<BoxStep<E>> + Send + Sync + 'static,
    {
        self.decoders.insert(name.to_string(), Box::new(decoder));
        self
    }

    /// Registers a step whose payload is its serde representation,
    /// ignoring the persisted version.
    pub fn register_serde<T>(&mut self, name: &str) -> &mut Self
    where
        T: Step<E> + DeserializeOwned + 'static,
    {
        self.register(name, |_, data| {
            let step: T = serde_json::from_value(data)?;
            Ok(Box::new(step) as BoxStep<E>)
        })
    }

    /// Decodes steps persisted under `old` with the decoder for `new`.
    pub fn alias(&mut self, old: &str, new: &str) -> &mut Self {
        self.aliases.insert(old.to_string(), new.to_string());
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    fn resolve(&self, name: &str) -> Option<&Decoder<E>> {
        self.decoders.get(name).or_else(|| {
            self.aliases
                .get(name)
                .and_then(|target| self.decoders.get(target))
        })
    }

    /// Refuses to encode unregistered tags so nothing is persisted that a
    /// later restart could not decode.
    pub fn encode(&self, step: &dyn Step<E>) -> Result<StoredStep> {
        let name = step.name();
        if !self.contains(name) {
            return Err(FateError::UnknownStep(name.to_string()));
        }
        Ok(StoredStep {
            name: name.to_string(),
            version: step.version(),
            data: step.to_json()?,
        })
    }

    pub fn decode(&self, stored: &StoredStep) -> Result<BoxStep<E>> {
        let decoder = self
            .resolve(&stored.name)
            .ok_or_else(|| FateError::UnknownStep(stored.name.clone()))?;
        decoder(stored.version, stored.data.clone())
    }
}
