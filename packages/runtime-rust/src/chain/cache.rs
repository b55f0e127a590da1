//! Compiled-chain cache keyed by message type.
//!
//! Reads are lock-free snapshots through `ArcSwap`. Compilation happens outside
//! any lock; the insert is a compare-and-swap that keeps the first chain
//! installed for a key, so concurrent callers always observe one chain.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::compiler::{Chain, ChainCompiler};
use super::descriptor::HandlerDescriptor;
use crate::error::StartupError;

type ChainMap = HashMap<String, Arc<Chain>>;

pub struct ChainCache {
    chains: ArcSwap<ChainMap>,
}

impl Default for ChainCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            chains: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Replace the whole cache with a freshly compiled set.
    pub fn install(&self, chains: ChainMap) {
        self.chains.store(Arc::new(chains));
    }

    #[must_use]
    pub fn get(&self, message_type: &str) -> Option<Arc<Chain>> {
        self.chains.load().get(message_type).cloned()
    }

    /// Return the cached chain, compiling and inserting it if absent.
    ///
    /// When two callers race, both may compile but only the first insert wins
    /// and both receive that chain.
    ///
    /// # Errors
    ///
    /// Propagates compilation errors; nothing is inserted on error.
    pub fn get_or_compile(
        &self,
        descriptor: &HandlerDescriptor,
        compiler: &ChainCompiler,
    ) -> Result<Arc<Chain>, StartupError> {
        let key = descriptor.message_type.as_str();
        if let Some(chain) = self.get(key) {
            return Ok(chain);
        }

        let compiled = Arc::new(compiler.compile(descriptor)?);
        let previous = self.chains.rcu(|current| {
            if current.contains_key(key) {
                Arc::clone(current)
            } else {
                let mut next = ChainMap::clone(current);
                next.insert(key.to_string(), Arc::clone(&compiled));
                Arc::new(next)
            }
        });
        Ok(previous.get(key).cloned().unwrap_or(compiled))
    }

    /// Recompile every descriptor and swap the result in atomically.
    ///
    /// # Errors
    ///
    /// Leaves the current cache untouched when any descriptor fails.
    pub fn rebuild<'a>(
        &self,
        descriptors: impl IntoIterator<Item = &'a HandlerDescriptor>,
        compiler: &ChainCompiler,
    ) -> Result<usize, StartupError> {
        let chains = compiler.compile_all(descriptors)?;
        let count = chains.len();
        self.install(chains);
        tracing::info!(chains = count, "chain cache rebuilt");
        Ok(count)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chains.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Message types with a compiled chain.
    #[must_use]
    pub fn message_types(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.chains.load().keys().cloned().collect();
        keys.sort();
        keys
    }
}
