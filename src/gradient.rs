//! Per-branch gradient orchestration.
//!
//! The surrounding likelihood engine supplies forward quantities through two
//! provider contracts; this module wires message backprop, the configured
//! strategy and the registered mapper into one flat gradient vector per
//! branch, and drives independent branches in parallel.

use std::collections::HashMap;

use log::debug;
use rayon::prelude::*;

use crate::backprop::backprop_messages;
use crate::mappers::ParameterMapper;
use crate::strategy::PrimitiveBackprop;
use crate::types::{BranchCache, CanonicalAdjoint, GradientError};

/// Forward branch quantities keyed by tree node, cached for the duration of
/// one likelihood-plus-gradient evaluation.
pub trait BranchCacheProvider: Sync {
    fn branch_cache(&self, node: usize) -> Option<&BranchCache>;
}

/// Canonical-parameter adjoints keyed by tree node.
pub trait CanonicalAdjointProvider: Sync {
    fn canonical_adjoint(&self, node: usize) -> Option<&CanonicalAdjoint>;
}

/// Map-backed cache provider for hosts that precompute all branches.
#[derive(Debug, Default)]
pub struct MapCacheProvider {
    caches: HashMap<usize, BranchCache>,
}

impl MapCacheProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: usize, cache: BranchCache) {
        self.caches.insert(node, cache);
    }

    /// Drop all cached branches, e.g. after a parameter or topology change.
    pub fn invalidate(&mut self) {
        self.caches.clear();
    }
}

impl BranchCacheProvider for MapCacheProvider {
    fn branch_cache(&self, node: usize) -> Option<&BranchCache> {
        self.caches.get(&node)
    }
}

/// One shared adjoint reused for every node. Valid when the forward
/// accumulation of canonical parameters is a pure sum over branches, which
/// makes each branch's adjoint equal to the root-level one.
#[derive(Debug, Clone)]
pub struct BroadcastAdjointProvider {
    adjoint: CanonicalAdjoint,
}

impl BroadcastAdjointProvider {
    pub fn new(adjoint: CanonicalAdjoint) -> Self {
        Self { adjoint }
    }
}

impl CanonicalAdjointProvider for BroadcastAdjointProvider {
    fn canonical_adjoint(&self, _node: usize) -> Option<&CanonicalAdjoint> {
        Some(&self.adjoint)
    }
}

/// The per-branch gradient pipeline: message backprop, primitive-parameter
/// strategy, parameter mapper. Holds no per-branch state.
pub struct BranchGradient {
    strategy: PrimitiveBackprop,
    mapper: Box<dyn ParameterMapper>,
    root: usize,
}

impl BranchGradient {
    pub fn new(
        strategy: PrimitiveBackprop,
        mapper: Box<dyn ParameterMapper>,
        root: usize,
    ) -> Self {
        Self {
            strategy,
            mapper,
            root,
        }
    }

    /// Total length of the flat output vector.
    pub fn dimension(&self) -> usize {
        self.mapper.dimension()
    }

    /// Gradient of the log likelihood with respect to the registered free
    /// parameters, for the branch above `node`. The root has no parent
    /// branch, and a node missing from either provider contributes nothing;
    /// both return an all-zero vector rather than an error.
    pub fn gradient_for_branch<C, A>(
        &self,
        node: usize,
        caches: &C,
        adjoints: &A,
    ) -> Result<Vec<f64>, GradientError>
    where
        C: BranchCacheProvider,
        A: CanonicalAdjointProvider,
    {
        let mut out = vec![0.0; self.dimension()];
        if node == self.root {
            return Ok(out);
        }
        let (cache, adjoint) = match (
            caches.branch_cache(node),
            adjoints.canonical_adjoint(node),
        ) {
            (Some(c), Some(a)) => (c, a),
            _ => {
                debug!("node {node}: no forward data, zero gradient");
                return Ok(out);
            }
        };

        let branch_adjoints = backprop_messages(cache, adjoint)?;
        let primitives = self.strategy.gradients(cache, &branch_adjoints)?;
        self.mapper.map(cache, &primitives, &mut out, 0)?;
        Ok(out)
    }

    /// Gradients for many branches, computed in parallel. Branches are
    /// independent given the read-only providers.
    pub fn gradients_for_branches<C, A>(
        &self,
        nodes: &[usize],
        caches: &C,
        adjoints: &A,
    ) -> Result<Vec<Vec<f64>>, GradientError>
    where
        C: BranchCacheProvider,
        A: CanonicalAdjointProvider,
    {
        nodes
            .par_iter()
            .map(|&node| self.gradient_for_branch(node, caches, adjoints))
            .collect()
    }
}
